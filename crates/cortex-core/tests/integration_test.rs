use cortex_core::*;
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::{tempdir, TempDir};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn test_config() -> CortexConfig {
    let mut config = CortexConfig::default();
    config.rate_limit.enabled = false;
    config.storage.lock_timeout_ms = 2_000;
    config
}

fn open_cortex() -> (Cortex, TempDir) {
    init_logging();
    let dir = tempdir().unwrap();
    let cortex = Cortex::open(dir.path(), test_config()).unwrap();
    (cortex, dir)
}

fn id(raw: &str) -> FileId {
    FileId::new(raw).unwrap()
}

// ── Write Atomicity ──────────────────────────────────────────────────────────

#[test]
fn test_writes_leave_no_partial_files() {
    let (cortex, dir) = open_cortex();
    let big = "line of text\n".repeat(2_000);
    for round in 0..5 {
        cortex.write_file("notes/big.md", &format!("{}{}", round, big), None).unwrap();
    }

    let on_disk = std::fs::read_to_string(dir.path().join("notes/big.md")).unwrap();
    assert_eq!(on_disk, format!("4{}", big));

    let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("notes"))
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name != "big.md")
        .collect();
    assert!(leftovers.is_empty(), "stray files: {:?}", leftovers);
}

#[test]
fn test_rejected_write_keeps_previous_content() {
    let (cortex, dir) = open_cortex();
    cortex.write_file("a.md", "stable", None).unwrap();

    let conflicted = "<<<<<<< HEAD\nmine\n=======\ntheirs\n>>>>>>> branch\n";
    assert!(matches!(
        cortex.write_file("a.md", conflicted, None),
        Err(CortexError::MergeMarkersPresent { line: 1, .. })
    ));

    let huge = "x".repeat(2 * 1024 * 1024);
    assert!(matches!(
        cortex.write_file("a.md", &huge, None),
        Err(CortexError::FileTooLarge { .. })
    ));

    assert_eq!(std::fs::read_to_string(dir.path().join("a.md")).unwrap(), "stable");
    assert_eq!(cortex.get_version_history("a.md", None).unwrap().len(), 1);
}

// ── Optimistic Concurrency ───────────────────────────────────────────────────

#[test]
fn test_write_with_current_hash_succeeds() {
    let (cortex, _dir) = open_cortex();
    cortex.write_file("a.md", "v1", None).unwrap();
    let seen = cortex.read_file("a.md").unwrap();

    let outcome = cortex.write_file("a.md", "v2", Some(&seen.hash)).unwrap();
    assert_eq!(outcome.version, 2);
}

#[test]
fn test_write_with_stale_hash_conflicts() {
    let (cortex, _dir) = open_cortex();
    cortex.write_file("a.md", "v1", None).unwrap();
    let seen = cortex.read_file("a.md").unwrap();
    let other = cortex.write_file("a.md", "v2 from elsewhere", None).unwrap();

    match cortex.write_file("a.md", "v2 from me", Some(&seen.hash)) {
        Err(CortexError::Conflict { expected, actual, .. }) => {
            assert_eq!(expected, seen.hash);
            assert_eq!(actual, Some(other.hash));
        }
        other => panic!("expected conflict, got {:?}", other),
    }
    assert_eq!(cortex.read_file("a.md").unwrap().content, "v2 from elsewhere");
}

#[test]
fn test_concurrent_writers_never_both_win_against_stale_base() {
    let (cortex, _dir) = open_cortex();
    let base = cortex.write_file("shared.md", "base", None).unwrap().hash;
    let cortex = Arc::new(cortex);

    let writers = 8;
    let barrier = Arc::new(Barrier::new(writers));
    let handles: Vec<_> = (0..writers)
        .map(|i| {
            let cortex = Arc::clone(&cortex);
            let barrier = Arc::clone(&barrier);
            let base = base.clone();
            thread::spawn(move || {
                barrier.wait();
                cortex.write_file("shared.md", &format!("writer {}", i), Some(&base))
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    assert!(results
        .iter()
        .filter(|r| r.is_err())
        .all(|r| matches!(r, Err(CortexError::Conflict { .. }))));

    let current = cortex.read_file("shared.md").unwrap();
    assert_eq!(current.hash, winners[0].hash);
    assert_eq!(winners[0].version, 2);
}

#[test]
fn test_concurrent_blind_writers_get_distinct_versions() {
    let (cortex, _dir) = open_cortex();
    let cortex = Arc::new(cortex);

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let cortex = Arc::clone(&cortex);
            thread::spawn(move || cortex.write_file("log.md", &format!("entry {}", i), None).unwrap())
        })
        .collect();
    let mut versions: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap().version).collect();
    versions.sort_unstable();
    assert_eq!(versions, vec![1, 2, 3, 4, 5, 6]);

    let latest = &cortex.get_version_history("log.md", Some(1)).unwrap()[0];
    assert_eq!(latest.content_hash, cortex.read_file("log.md").unwrap().hash);
}

/// Version number embedded in a `v<n> [l](l<n>.md)` entry, checking that the
/// two halves agree.
fn entry_number(text: &str) -> u64 {
    let n: u64 = text
        .trim_end()
        .strip_prefix('v')
        .and_then(|rest| rest.split(' ').next())
        .and_then(|n| n.parse().ok())
        .unwrap_or_else(|| panic!("unexpected entry {:?}", text));
    assert_eq!(text.trim_end(), format!("v{} [l](l{}.md)", n, n));
    n
}

#[test]
fn test_reads_during_writes_see_matching_records() {
    init_logging();
    let dir = tempdir().unwrap();
    let mut config = test_config();
    config.history.max_versions_per_file = 1_000;
    let cortex = Arc::new(Cortex::open(dir.path(), config).unwrap());
    cortex.write_file("log.md", "v1 [l](l1.md)", None).unwrap();
    cortex.write_file("page.md", "{{include:log.md}}", None).unwrap();

    const WRITES: u64 = 150;
    let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let writer = {
        let cortex = Arc::clone(&cortex);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            for n in 2..=WRITES {
                let outcome = cortex.write_file("log.md", &format!("v{} [l](l{}.md)", n, n), None).unwrap();
                assert_eq!(outcome.version, n);
            }
            done.store(true, std::sync::atomic::Ordering::SeqCst);
        })
    };

    let readers: Vec<_> = (0..3)
        .map(|r| {
            let cortex = Arc::clone(&cortex);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut round = 0u64;
                while !done.load(std::sync::atomic::Ordering::SeqCst) {
                    round += 1;

                    let view = cortex.read_file("log.md").unwrap();
                    let n = entry_number(&view.content);
                    assert_eq!(view.hash, cortex_core::storage::compute_hash(view.content.as_bytes()));
                    assert_eq!(view.dependencies[0].target_id, id(&format!("l{}.md", n)));

                    let record = cortex.get_metadata("log.md").unwrap();
                    let version = cortex
                        .get_version_history("log.md", None)
                        .unwrap()
                        .into_iter()
                        .find(|v| v.version == record.current_version)
                        .expect("current version is retained");
                    assert_eq!(version.content_hash, record.content_hash);
                    assert_eq!(record.links[0].target_id, id(&format!("l{}.md", record.current_version)));

                    entry_number(&cortex.resolve_transclusions("page.md", None).unwrap());

                    if round % 10 == r {
                        cortex.sync().unwrap();
                        assert!(cortex.list_files().iter().any(|f| f.id == id("log.md")));
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    let record = cortex.get_metadata("log.md").unwrap();
    assert_eq!(record.current_version, WRITES);
    assert_eq!(entry_number(&cortex.read_file("log.md").unwrap().content), WRITES);
}

// ── Index Self-Repair ────────────────────────────────────────────────────────

#[test]
fn test_corrupted_index_is_rebuilt_on_open() {
    init_logging();
    let dir = tempdir().unwrap();
    let expected = {
        let cortex = Cortex::open(dir.path(), test_config()).unwrap();
        cortex.write_file("README.md", "# Readme\n", None).unwrap();
        cortex.write_file("docs/guide.md", "{{include:docs/setup.md}}\n", None).unwrap();
        cortex.write_file("docs/setup.md", "## Setup\nrun it\n", None).unwrap();
        cortex.write_file("docs/setup.md", "## Setup\nrun it twice\n", None).unwrap();
        cortex.list_files()
    };

    let index_path = dir.path().join(".cortex").join("index.json");
    std::fs::write(&index_path, b"{ this is not json").unwrap();

    let cortex = Cortex::open(dir.path(), test_config()).unwrap();
    assert_eq!(cortex.warnings().len(), 1);
    assert!(cortex.warnings()[0].contains("rebuilt"));

    let rebuilt = cortex.list_files();
    let ids: Vec<_> = rebuilt.iter().map(|r| r.id.clone()).collect();
    let expected_ids: Vec<_> = expected.iter().map(|r| r.id.clone()).collect();
    assert_eq!(ids, expected_ids);
    for (fresh, old) in rebuilt.iter().zip(&expected) {
        assert_eq!(fresh.content_hash, old.content_hash);
        assert_eq!(fresh.links, old.links);
        assert_eq!(fresh.current_version, old.current_version);
    }

    let backups = std::fs::read_dir(dir.path().join(".cortex"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("index.json.corrupt-"))
        .count();
    assert_eq!(backups, 1);

    let guide = cortex.read_file("docs/guide.md").unwrap();
    assert_eq!(guide.dependencies[0].kind, LinkKind::Transclusion);
}

#[test]
fn test_index_survives_reopen() {
    init_logging();
    let dir = tempdir().unwrap();
    {
        let cortex = Cortex::open(dir.path(), test_config()).unwrap();
        cortex.write_file("a.md", "one", None).unwrap();
        cortex.write_file("a.md", "two", None).unwrap();
        cortex.read_file("a.md").unwrap();
    }

    let cortex = Cortex::open(dir.path(), test_config()).unwrap();
    assert!(cortex.warnings().is_empty());
    let record = cortex.get_metadata("a.md").unwrap();
    assert_eq!(record.current_version, 2);
    assert_eq!(record.read_count, 1);
}

#[test]
fn test_edits_while_closed_are_picked_up() {
    init_logging();
    let dir = tempdir().unwrap();
    {
        let cortex = Cortex::open(dir.path(), test_config()).unwrap();
        cortex.write_file("a.md", "one", None).unwrap();
        cortex.write_file("gone.md", "bye", None).unwrap();
    }
    std::fs::write(dir.path().join("a.md"), "[b](b.md)").unwrap();
    std::fs::write(dir.path().join("b.md"), "new").unwrap();
    std::fs::remove_file(dir.path().join("gone.md")).unwrap();

    let cortex = Cortex::open(dir.path(), test_config()).unwrap();
    let ids: Vec<_> = cortex.list_files().into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![id("a.md"), id("b.md")]);
    assert_eq!(cortex.get_dependency_graph(GraphFormat::Raw), {
        let graph = DependencyGraph::new();
        graph.rebuild_dynamic_edges(&id("a.md"), &[Link { target_id: id("b.md"), kind: LinkKind::Reference }]);
        graph.register_file(&id("b.md"));
        graph.export(GraphFormat::Raw)
    });
}

// ── Version History ──────────────────────────────────────────────────────────

#[test]
fn test_rollback_round_trip() {
    let (cortex, _dir) = open_cortex();
    cortex.write_file("A.md", "first draft\n", None).unwrap();
    let current = cortex.write_file("A.md", "second draft\n", None).unwrap();

    let preview = cortex.rollback("A.md", 1).unwrap();
    assert_eq!(preview.content, "first draft\n");
    assert_eq!(preview.target.version, 1);
    // Nothing written yet.
    assert_eq!(cortex.read_file("A.md").unwrap().hash, current.hash);

    let rewritten = cortex.write_file("A.md", &preview.content, Some(&current.hash)).unwrap();
    assert_eq!(rewritten.version, 3);
    assert_eq!(rewritten.hash, preview.target.content_hash);
}

#[test]
fn test_every_retained_version_restores_exactly() {
    let (cortex, _dir) = open_cortex();
    let contents: Vec<String> = (1..=5).map(|i| format!("# Draft {}\n\nbody {}\n", i, i)).collect();
    for content in &contents {
        cortex.write_file("doc.md", content, None).unwrap();
    }

    let history = cortex.get_version_history("doc.md", None).unwrap();
    let versions: Vec<u64> = history.iter().map(|v| v.version).collect();
    assert_eq!(versions, vec![5, 4, 3, 2, 1]);

    for (i, content) in contents.iter().enumerate() {
        let preview = cortex.rollback("doc.md", i as u64 + 1).unwrap();
        assert_eq!(&preview.content, content);
    }

    let restored = cortex.restore_version("doc.md", 3, None).unwrap();
    assert_eq!(restored.version, 6);
    assert_eq!(cortex.read_file("doc.md").unwrap().content, contents[2]);
}

#[test]
fn test_history_is_pruned_to_the_configured_limit() {
    init_logging();
    let dir = tempdir().unwrap();
    let mut config = test_config();
    config.history.max_versions_per_file = 3;
    let cortex = Cortex::open(dir.path(), config).unwrap();

    for i in 1..=6 {
        cortex.write_file("a.md", &format!("v{}", i), None).unwrap();
    }
    let versions: Vec<u64> = cortex
        .get_version_history("a.md", None)
        .unwrap()
        .iter()
        .map(|v| v.version)
        .collect();
    assert_eq!(versions, vec![6, 5, 4]);
    assert!(matches!(
        cortex.rollback("a.md", 1),
        Err(CortexError::RollbackTargetMissing { version: 1, .. })
    ));
}

#[test]
fn test_changed_sections_are_recorded() {
    let (cortex, _dir) = open_cortex();
    cortex
        .write_file("a.md", "# Title\n## Install\nold\n## Usage\nsame\n", None)
        .unwrap();
    cortex
        .write_file("a.md", "# Title\n## Install\nnew\n## Usage\nsame\n", None)
        .unwrap();

    let latest = &cortex.get_version_history("a.md", Some(1)).unwrap()[0];
    assert!(latest.changed_sections.contains(&"Install".to_string()));
    assert!(!latest.changed_sections.contains(&"Usage".to_string()));
}

// ── Transclusion ─────────────────────────────────────────────────────────────

#[test]
fn test_include_scenario() {
    let (cortex, _dir) = open_cortex();
    cortex.write_file("A.md", "before\n{{include:B.md}}\nafter\n", None).unwrap();
    cortex.write_file("B.md", "hello", None).unwrap();

    let rendered = cortex.resolve_transclusions("A.md", None).unwrap();
    assert_eq!(rendered, "before\nhello\nafter\n");

    let edges = match cortex.get_dependency_graph(GraphFormat::Raw) {
        GraphView::Raw(snapshot) => snapshot.edges,
        other => panic!("expected raw graph, got {:?}", other),
    };
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].from, id("A.md"));
    assert_eq!(edges[0].to, id("B.md"));
    assert_eq!(edges[0].link_kind, LinkKind::Transclusion);
}

#[test]
fn test_include_sees_updates_of_the_target() {
    let (cortex, dir) = open_cortex();
    cortex.write_file("A.md", "{{include:B.md}}", None).unwrap();
    cortex.write_file("B.md", "one", None).unwrap();
    assert_eq!(cortex.resolve_transclusions("A.md", None).unwrap(), "one");

    cortex.write_file("B.md", "two", None).unwrap();
    assert_eq!(cortex.resolve_transclusions("A.md", None).unwrap(), "two");

    std::fs::write(dir.path().join("B.md"), "three").unwrap();
    assert_eq!(cortex.resolve_transclusions("A.md", None).unwrap(), "three");
}

#[test]
fn test_transclusion_cycle_is_reported() {
    let (cortex, _dir) = open_cortex();
    cortex.write_file("A.md", "{{include:B.md}}", None).unwrap();
    cortex.write_file("B.md", "{{include:A.md}}", None).unwrap();

    match cortex.resolve_transclusions("A.md", None) {
        Err(CortexError::CircularDependency { stack }) => {
            assert_eq!(stack, vec![id("A.md"), id("B.md"), id("A.md")]);
        }
        other => panic!("expected cycle, got {:?}", other),
    }
}

#[test]
fn test_reference_cycle_does_not_block_loading_order() {
    let (cortex, _dir) = open_cortex();
    cortex.write_file("a.md", "[b](b.md)", None).unwrap();
    cortex.write_file("b.md", "[a](a.md)", None).unwrap();
    cortex.write_file("README.md", "# Start here", None).unwrap();

    let order = cortex.loading_order(None).unwrap();
    assert_eq!(order, vec![id("README.md"), id("a.md"), id("b.md")]);
    assert_eq!(cortex.resolve_transclusions("a.md", None).unwrap(), "[b](b.md)");
}

#[test]
fn test_depth_limit() {
    let (cortex, _dir) = open_cortex();
    for i in 0..4 {
        cortex
            .write_file(&format!("level{}.md", i), &format!("{{{{include:level{}.md}}}}", i + 1), None)
            .unwrap();
    }
    cortex.write_file("level4.md", "bottom", None).unwrap();

    assert_eq!(cortex.resolve_transclusions("level0.md", None).unwrap(), "bottom");
    assert!(matches!(
        cortex.resolve_transclusions("level0.md", Some(2)),
        Err(CortexError::DepthExceeded { max_depth: 2, .. })
    ));
}

#[test]
fn test_section_include_and_missing_target() {
    let (cortex, _dir) = open_cortex();
    cortex
        .write_file("guide.md", "# Guide\n## Install\nrun setup\n## Usage\ncall it\n", None)
        .unwrap();
    cortex
        .write_file("main.md", "{{include:guide.md#Usage}}\n{{include:nowhere.md}}\n", None)
        .unwrap();

    let rendered = cortex.resolve_transclusions("main.md", None).unwrap();
    assert!(rendered.starts_with("## Usage\ncall it\n"));
    assert!(rendered.contains("[transclusion error: nowhere.md:"));
    assert!(matches!(
        cortex.resolve_transclusions("missing.md", None),
        Err(CortexError::NotFound(_))
    ));
}

// ── Paths & Limits ───────────────────────────────────────────────────────────

#[test]
fn test_paths_outside_the_root_are_rejected() {
    let (cortex, dir) = open_cortex();
    for bad in ["../outside.md", "a/../../outside.md", "/tmp/abs.md", ".cortex/index.json"] {
        assert!(
            matches!(cortex.read_file(bad), Err(CortexError::PathRejected { .. })),
            "{} should be rejected",
            bad
        );
    }
    assert!(!dir.path().parent().unwrap().join("outside.md").exists());
}

#[test]
fn test_rate_limit_applies_to_reads_and_writes() {
    init_logging();
    let dir = tempdir().unwrap();
    let mut config = test_config();
    config.rate_limit.enabled = true;
    config.rate_limit.ops_per_second = 0.5;
    config.rate_limit.burst = 2;
    config.rate_limit.max_wait_ms = 0;
    let cortex = Cortex::open(dir.path(), config).unwrap();

    cortex.write_file("a.md", "one", None).unwrap();
    cortex.read_file("a.md").unwrap();
    assert!(matches!(cortex.read_file("a.md"), Err(CortexError::RateLimited { .. })));
    assert!(matches!(
        cortex.write_file("a.md", "two", None),
        Err(CortexError::RateLimited { .. })
    ));
    // Metadata lookups do not consume tokens.
    assert_eq!(cortex.get_metadata("a.md").unwrap().current_version, 1);
}

#[test]
fn test_config_round_trips_through_toml() {
    let mut config = test_config();
    config.transclusion.max_depth = 4;
    let text = config.to_toml_string().unwrap();
    let parsed = CortexConfig::from_toml_str(&text).unwrap();
    assert_eq!(parsed.transclusion.max_depth, 4);
    assert!(!parsed.rate_limit.enabled);
}
