use std::process::Command;

#[test]
fn init_creates_valid_toml() {
    let dir = tempfile::tempdir().unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_lodestone"))
        .arg("init")
        .current_dir(dir.path())
        .output()
        .unwrap();

    assert!(output.status.success(), "lodestone init failed: {}", String::from_utf8_lossy(&output.stderr));

    let config_path = dir.path().join(".lodestone.toml");
    assert!(config_path.exists(), ".lodestone.toml should exist");

    let content = std::fs::read_to_string(&config_path).unwrap();
    assert!(content.contains("[store]"));
    assert!(content.contains("[embedding]"));
    assert!(content.contains("[rerank]"));

    // The template must parse back into the defaults
    let config = lodestone_core::LodestoneConfig::from_toml(&content).unwrap();
    assert_eq!(config.query.default_k, 5);
    let _raw: toml::Value = toml::from_str(&content).unwrap();
}

#[test]
fn init_refuses_if_exists() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(".lodestone.toml"), "# existing").unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_lodestone"))
        .arg("init")
        .current_dir(dir.path())
        .output()
        .unwrap();

    assert!(!output.status.success());
    let content = std::fs::read_to_string(dir.path().join(".lodestone.toml")).unwrap();
    assert_eq!(content, "# existing");
}
