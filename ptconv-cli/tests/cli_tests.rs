use std::fs;
use std::path::Path;
use std::process::Command;

use ptconv::fixture::CheckpointBuilder;
use ptconv::serialize::load_file;
use ptconv::{Dtype, Tensor, TensorMap};
use ptconv_cli::{ConvertApp, Outcome};
use tempfile::tempdir;

fn write_model(path: &Path) -> TensorMap {
    let data: Vec<f32> = (0..256).map(|i| i as f32).collect();
    let embed = Tensor::from_slice(Dtype::F32, vec![16, 16], &data).unwrap();
    let bias = Tensor::from_slice(Dtype::F16, vec![4], &[0x3c00u16; 4]).unwrap();

    let mut map = TensorMap::new();
    map.insert("embed.weight", embed.clone());
    map.insert("bias", bias);
    map.insert("head.weight", embed);
    CheckpointBuilder::new(map.clone()).write(path).unwrap();
    map
}

#[test]
fn converts_and_prints_success() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("model.bin");
    let original = write_model(&input);

    let app = ConvertApp::new(input);
    let mut out = Vec::new();
    let outcome = app.run(&mut out).unwrap();

    let expected = dir.path().join("model.safetensors");
    assert_eq!(app.output(), expected.as_path());
    assert_eq!(
        String::from_utf8(out).unwrap(),
        format!("{}\nSuccess\n", expected.display())
    );

    let Outcome::Converted(report) = outcome else {
        panic!("expected a conversion");
    };
    assert_eq!(report.aliases_removed, vec!["head.weight".to_string()]);

    let written = load_file(&expected).unwrap();
    assert_eq!(written.len(), 2);
    for name in ["embed.weight", "bias"] {
        assert!(written.get(name).unwrap().equal(original.get(name).unwrap()));
    }
}

#[test]
fn existing_output_is_not_overwritten() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("model.bin");
    write_model(&input);
    let existing = dir.path().join("model.safetensors");
    fs::write(&existing, b"keep me").unwrap();

    let mut out = Vec::new();
    let outcome = ConvertApp::new(input).run(&mut out).unwrap();

    assert!(matches!(outcome, Outcome::AlreadyExists(_)));
    assert_eq!(
        String::from_utf8(out).unwrap(),
        format!(
            "{}\nError: {} already exists\n",
            existing.display(),
            existing.display()
        )
    );
    assert_eq!(fs::read(&existing).unwrap(), b"keep me");
}

#[test]
fn conversion_errors_propagate() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("broken.bin");
    fs::write(&input, b"not a checkpoint").unwrap();

    let mut out = Vec::new();
    let err = ConvertApp::new(input).run(&mut out).unwrap_err();
    assert!(format!("{err:#}").contains("not a zip-based PyTorch checkpoint"));
}

#[test]
fn binary_exit_codes() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("model.bin");
    write_model(&input);

    let bin = env!("CARGO_BIN_EXE_bin-to-safetensors");

    let first = Command::new(bin).arg(&input).output().unwrap();
    assert!(first.status.success());
    assert!(String::from_utf8_lossy(&first.stdout).ends_with("Success\n"));

    let second = Command::new(bin).arg(&input).output().unwrap();
    assert!(second.status.success());
    assert!(String::from_utf8_lossy(&second.stdout).contains("already exists"));

    let garbage = dir.path().join("garbage.pt");
    fs::write(&garbage, b"\x80\x02}q\x00.").unwrap();
    let failed = Command::new(bin).arg(&garbage).output().unwrap();
    assert!(!failed.status.success());
}
