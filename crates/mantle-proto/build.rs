fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/serving.proto", "proto/health.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/serving.proto");
    println!("cargo:rerun-if-changed=proto/health.proto");

    Ok(())
}
