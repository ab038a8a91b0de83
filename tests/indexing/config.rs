//! Loading `trellis.toml`

use crate::common::*;
use std::fs;
use tempfile::TempDir;

#[test]
fn missing_file_is_created_with_defaults() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let db = Database::open_with_config_dir(dir.path()).unwrap();

    assert!(dir.path().join("trellis.toml").exists());
    assert_eq!(db.config(), &TrellisConfig::default());
}

#[test]
fn file_settings_reach_the_database() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("trellis.toml"),
        r#"
[link_bag]
embedded_to_tree_threshold = 2

[index]
ignore_null_values = false
default_collation = "ci"
"#,
    )
    .unwrap();

    let db = Database::open_with_config_dir(dir.path()).unwrap();
    assert_eq!(db.config().link_bag.embedded_to_tree_threshold, 2);
    assert_eq!(db.config().transaction.max_staged_records, 0);

    db.create_class("P").unwrap();
    index_on(&db, "P", "name", PropertyType::String, false);
    let index = db.index("P.name").unwrap();
    assert!(!index.definition().ignore_null_values());
    assert_eq!(index.definition().collation_name("name"), Some("ci"));

    let mut session = db.session();
    let id = insert(&mut session, "P", vec![("name", Value::from("Mixed"))]);
    assert_eq!(session.index_get("P.name", &index_key!["MIXED"]).unwrap(), vec![id]);
}

#[test]
fn invalid_settings_are_rejected() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("trellis.toml"),
        "[index]\ndefault_collation = \"klingon\"\n",
    )
    .unwrap();
    assert!(matches!(
        Database::open_with_config_dir(dir.path()),
        Err(Error::Config(_))
    ));

    let mut config = TrellisConfig::default();
    config.link_bag.embedded_to_tree_threshold = 4;
    config.link_bag.tree_to_embedded_threshold = 4;
    assert!(matches!(Database::open(config), Err(Error::Config(_))));
}
