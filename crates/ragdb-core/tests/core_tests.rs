use std::fs;
use std::io::Write;
use tempfile::TempDir;

use figment::providers::{Format, Serialized, Toml};
use figment::Figment;
use proptest::prelude::*;

use ragdb_core::chunking::{chunk, ChunkStrategy};
use ragdb_core::config::{Config, EngineConfig, FusionMethod, Quantization};
use ragdb_core::loader::TxtDirectoryLoader;
use ragdb_core::traits::DocumentLoader;
use ragdb_core::{Document, Error};

#[test]
fn loader_single_small_file() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    let file_path = dir.join("a.txt");
    let mut f = fs::File::create(&file_path).unwrap();
    writeln!(f, "Short text").unwrap();

    let docs = TxtDirectoryLoader::new(dir).load().expect("load");

    assert_eq!(docs.len(), 1, "one file becomes one document");
    assert_eq!(docs[0].raw_text.trim(), "Short text");
    assert_eq!(docs[0].id, "a");
    assert_eq!(docs[0].metadata["category"], "misc");
}

#[test]
fn loader_limit_and_category_from_path() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    fs::create_dir_all(dir.join("fire/craft")).unwrap();
    fs::write(dir.join("fire/craft/a.txt"), "alpha bravo").unwrap();
    fs::write(dir.join("fire/b.txt"), "charlie delta").unwrap();
    fs::write(dir.join("notes.md"), "ignored").unwrap();

    let all = TxtDirectoryLoader::new(dir).load().expect("load");
    assert_eq!(all.len(), 2, "only .txt files are loaded");
    let craft = all.iter().find(|d| d.id == "fire/craft/a").expect("nested doc");
    assert_eq!(craft.metadata["category"], "fire/craft");

    let limited = TxtDirectoryLoader::new(dir).with_limit(1).load().expect("load limited");
    assert_eq!(limited.len(), 1, "limited to one source document");
}

#[test]
fn engine_config_merges_toml_over_defaults() {
    let toml = r#"
        [collection]
        dimension = 8
        quantization = "scalar"

        [search]
        fusion_method = "linear"
        alpha = 0.8

        [data.chunking]
        strategy = "fixed"
        size = 200
        overlap = 20
    "#;
    let figment = Figment::from(Serialized::defaults(EngineConfig::default())).merge(Toml::string(toml));
    let engine = Config::from_figment(figment).engine().expect("valid config");
    assert_eq!(engine.collection.dimension, 8);
    assert_eq!(engine.collection.quantization, Quantization::Scalar);
    assert_eq!(engine.collection.hnsw_m, 16, "untouched keys keep defaults");
    assert_eq!(engine.search.fusion_method, FusionMethod::Linear);
    assert_eq!(engine.data.chunking, ChunkStrategy::Fixed { size: 200, overlap: 20 });
}

#[test]
fn engine_config_rejects_out_of_range_alpha() {
    let figment = Figment::from(Serialized::defaults(EngineConfig::default()))
        .merge(Toml::string("[search]\nalpha = 1.5\n"));
    let err = Config::from_figment(figment).engine().expect_err("alpha out of range");
    assert!(matches!(err, Error::InvalidConfig(_)));
}

#[test]
fn config_load_from_directory() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("config.toml"), "[cache]\ncache_ttl_seconds = 42\n").unwrap();
    let config = Config::load_from(tmp.path()).expect("load");
    let ttl: u64 = config.get("cache.cache_ttl_seconds").expect("ttl");
    assert_eq!(ttl, 42);
}

#[test]
fn expand_and_resolve_paths() {
    let base = std::path::Path::new("/srv/data");
    assert_eq!(ragdb_core::config::resolve_with_base(base, "txt"), base.join("txt"));
    assert_eq!(ragdb_core::config::resolve_with_base(base, "/abs"), std::path::PathBuf::from("/abs"));
}

proptest! {
    #[test]
    fn chunking_is_deterministic(text in "[a-z .\n#]{0,400}", size in 8usize..64, overlap_pct in 0usize..90) {
        let overlap = size * overlap_pct / 100;
        let doc = Document::new(text);
        for strategy in [
            ChunkStrategy::Fixed { size, overlap },
            ChunkStrategy::Recursive { size, overlap },
            ChunkStrategy::Structural { size, overlap },
        ] {
            let a = chunk(&doc, &strategy).expect("chunk");
            let b = chunk(&doc, &strategy).expect("chunk");
            prop_assert_eq!(&a, &b);
            for (i, c) in a.iter().enumerate() {
                prop_assert_eq!(c.position_index, i);
                prop_assert!(!c.text.trim().is_empty());
                let oversized = c.metadata.get("oversized").is_some();
                prop_assert!(oversized || c.text.chars().count() <= size);
            }
        }
    }

    #[test]
    fn structural_chunks_carry_their_heading(title in "[a-z]{1,12}", sub in "[a-z]{1,12}", body in "[a-z ]{0,40}") {
        let text = format!("# {title}\n{body} intro.\n## {sub}\n{body} detail.\n");
        let chunks = chunk(&Document::new(text), &ChunkStrategy::Structural { size: 400, overlap: 0 }).expect("chunk");
        prop_assert_eq!(chunks.len(), 2);
        prop_assert_eq!(&chunks[0].metadata["heading"], &serde_json::Value::from(title.clone()));
        prop_assert_eq!(&chunks[0].metadata["heading_level"], &serde_json::Value::from(1));
        prop_assert_eq!(&chunks[1].metadata["heading_path"], &serde_json::Value::from(format!("{title} > {sub}")));
        prop_assert_eq!(&chunks[1].metadata["heading_level"], &serde_json::Value::from(2));
    }
}
