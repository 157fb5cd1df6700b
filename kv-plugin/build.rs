fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_prost_build::configure().compile_protos(
        &["proto/health.proto", "proto/plugin.proto", "proto/kv.proto"],
        &["proto"],
    )?;

    println!("cargo:rerun-if-changed=proto");
    println!("cargo:rerun-if-changed=build.rs");

    Ok(())
}
