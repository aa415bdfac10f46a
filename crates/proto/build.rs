// Build script to generate Rust code from protobuf definitions
use std::io::{Error, ErrorKind, Result};

fn main() -> Result<()> {
    // Use the vendored protoc unless the environment already provides one
    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path()
            .map_err(|e| Error::new(ErrorKind::Other, e.to_string()))?;
        std::env::set_var("PROTOC", protoc);
    }

    // Well-known types (google/protobuf/empty.proto) ship with the vendored protoc
    let well_known = protoc_bin_vendored::include_path()
        .map_err(|e| Error::new(ErrorKind::Other, e.to_string()))?;

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/predict.proto"], &[std::path::PathBuf::from("proto"), well_known])?;

    // Re-run build if the proto file changes
    println!("cargo:rerun-if-changed=proto/predict.proto");

    Ok(())
}
