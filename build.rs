use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);
    let proto_dir = PathBuf::from("proto");

    // Use the bundled protoc so builds do not depend on a system install
    let protoc = protoc_bin_vendored::protoc_bin_path().map_err(|e| e.to_string())?;
    std::env::set_var("PROTOC", protoc);

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=proto/");

    // The crate is both a client (global limit checks) and a server
    // (reference counting service), so generate both halves.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .file_descriptor_set_path(out_dir.join("meshguard_ratelimit_descriptor.bin"))
        .compile_protos(
            &[proto_dir.join("meshguard/ratelimit/v1/rls.proto")],
            &[&proto_dir],
        )?;

    Ok(())
}
