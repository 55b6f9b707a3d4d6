// Copyright 2024 Oxide Computer Company

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/mayastor.proto");

    // protox parses the schema in process so no protoc is needed.
    let fds = protox::compile(["proto/mayastor.proto"], ["proto"])?;
    tonic_build::configure()
        .build_server(false)
        .compile_fds(fds)?;
    Ok(())
}
