//! End-to-end scenario 1: load a native Linux/amd64 shared object compiled
//! from `tests/fixtures/basic.c` and run its `StartW` export.

#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

use std::path::PathBuf;
use std::process::Command;

use reflektor::Image;

fn build_fixture() -> PathBuf {
    let out_dir = std::env::temp_dir().join(format!("reflektor-test-{}", std::process::id()));
    std::fs::create_dir_all(&out_dir).unwrap();

    let source = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/basic.c");
    let build = cc::Build::new()
        .file(&source)
        .out_dir(&out_dir)
        .host("x86_64-unknown-linux-gnu")
        .target("x86_64-unknown-linux-gnu")
        .opt_level(0)
        .clone();
    let objects = build.compile_intermediates();
    let compiler = build.get_compiler();

    let so_path = out_dir.join("basic.so");
    let status = Command::new(compiler.path())
        .arg("-shared")
        .arg("-fPIC")
        .arg("-o")
        .arg(&so_path)
        .args(&objects)
        .status()
        .expect("failed to invoke linker");
    assert!(status.success(), "linking basic.so failed");

    so_path
}

#[test]
fn loads_and_invokes_start_w_export() {
    let marker = std::env::temp_dir().join(format!("reflektor-marker-{}.txt", std::process::id()));
    let _ = std::fs::remove_file(&marker);
    std::env::set_var("REFLEKTOR_MARKER", &marker);

    let so_path = build_fixture();
    let image = Image::load_from_path(&so_path).expect("image should load");
    image.call_export("StartW").expect("StartW should run");

    let contents = std::fs::read(&marker).expect("marker file should exist");
    assert_eq!(contents, b"ok");

    std::fs::remove_file(&marker).ok();
    image.free().expect("free should succeed");
}

#[test]
fn call_export_trims_and_rejects_unknown_names() {
    let marker = std::env::temp_dir().join(format!("reflektor-marker-unused-{}.txt", std::process::id()));
    std::env::set_var("REFLEKTOR_MARKER", &marker);

    let so_path = build_fixture();
    let image = Image::load_from_path(&so_path).expect("image should load");

    let err = image.call_export("DoesNotExist").unwrap_err();
    assert!(matches!(err, reflektor::Error::ExportNotFound { .. }));

    assert!(image.call_export("  StartW  ").is_ok());
    std::fs::remove_file(&marker).ok();
}
