//! Fixture archives shared by the unit tests

use crate::archive::{pack, PackRequest};
use crate::echo::EchoHandler;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Pack an archive for the built-in echo handler under `dir`
pub fn echo_archive(dir: &Path, model_name: &str, config: &str) -> PathBuf {
    let src = dir.join(format!("{}-src", model_name));
    std::fs::create_dir_all(&src).unwrap();
    let handler = src.join(format!("{}.toml", EchoHandler::MODULE));
    std::fs::write(&handler, b"# echo handler\n").unwrap();
    std::fs::write(src.join("model.bin"), b"model weights").unwrap();
    std::fs::write(src.join("config.yaml"), config).unwrap();

    let request = PackRequest::new(
        handler,
        src.join("model.bin"),
        src.join("config.yaml"),
        model_name,
        EchoHandler::CLASS,
    );
    pack(&request, dir).unwrap().path().to_path_buf()
}

/// Write a zip with arbitrary members, bypassing `pack`'s validation
pub fn write_zip(dir: &Path, name: &str, members: &[(&str, &[u8])]) -> PathBuf {
    let path = dir.join(name);
    let mut writer = zip::ZipWriter::new(File::create(&path).unwrap());
    for (member, bytes) in members {
        writer
            .start_file(*member, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(bytes).unwrap();
    }
    writer.finish().unwrap();
    path
}
