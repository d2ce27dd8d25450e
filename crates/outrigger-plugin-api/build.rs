use std::io::Result;

fn main() -> Result<()> {
    // plugin.proto carries the child service, the broker and the gateway front door
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/plugin.proto"], &["proto/"])?;
    println!("cargo:rerun-if-changed=proto/plugin.proto");
    Ok(())
}
