//! Catalog integration: registration round trips and crash recovery.

mod common;

use dlog::{
    dlog_warn, DbMpscBus, DbMpscBusConfig, FileDatabase, FileSinkId, LogContext, LogFabric,
    Severity, SpanScope,
};
use temp_dir::TempDir;

#[test]
fn reopen_yields_the_last_retired_contents() {
    common::trace_init();
    let dir = TempDir::new().unwrap();
    let catalog_path = dir.path().join("suite.drot");

    {
        let mut db = FileDatabase::open(&catalog_path).unwrap();
        db.create_record_container(
            &format!("{}/suite.{{ctr}}_{{now}}.dlog", dir.path().display()),
            FileSinkId::DEFAULT,
        )
        .unwrap();
        let created = db
            .create_message_bus(
                &format!("{}/suite.{{id}}.{{ctr}}_{{pid}}.dmpscb", dir.path().display()),
                "std".to_owned(),
                &dlog::BUS_MAGIC,
            )
            .unwrap();
        assert!(created.path.exists());
    }

    let db = FileDatabase::open(&catalog_path).unwrap();
    assert_eq!(db.record_containers().len(), 1);
    assert_eq!(db.message_buses().len(), 1);
    assert_eq!(db.message_buses()[0].id, "std");
    assert_eq!(db.message_buses()[0].magic, dlog::BUS_MAGIC.to_vec());

    db.try_clone().unwrap().unlink_all().unwrap();
    assert!(!catalog_path.exists());
}

fn fill_orphan_bus(db: &FileDatabase, dir: &TempDir) {
    let bus = DbMpscBus::create(DbMpscBusConfig {
        database: db,
        bus_id: "orphan".to_owned(),
        file_name_pattern: &format!("{}/orphan.{{id}}.{{ctr}}_{{pid}}.dmpscb", dir.path().display()),
        num_regions: 3,
        region_size: 8 * 4096,
    })
    .unwrap();

    let fabric = LogFabric::new(bus);
    dlog::set_thread_context(LogContext::new(fabric.record_port()));

    dlog_warn!("hello from no scope").unwrap();
    {
        let outer = SpanScope::open("recovery/outer");
        assert!(outer.is_active());
        dlog_warn!("hello from the outer scope").unwrap();
        {
            let inner = SpanScope::open("recovery/inner");
            assert!(inner.is_active());
            dlog_warn!("hello from the inner scope").unwrap();
        }
    }

    // The fabric is dropped without draining or unlinking: the bus file
    // stays registered and full, as if the process had crashed.
    dlog::set_thread_context(LogContext::disabled());
}

#[test]
fn prune_recovers_orphaned_bus_messages() {
    common::trace_init();
    let dir = TempDir::new().unwrap();
    let catalog_path = dir.path().join("recovery.drot");

    let mut db = FileDatabase::open(&catalog_path).unwrap();
    fill_orphan_bus(&db, &dir);

    db.fetch_content().unwrap();
    assert_eq!(db.message_buses().len(), 1);
    let bus_file = dir.path().join(&db.message_buses()[0].path);
    assert!(bus_file.exists());

    db.prune_message_buses(Some(&format!(
        "{}/recovered.{{ctr}}.dlog",
        dir.path().display()
    )))
    .unwrap();

    assert!(db.message_buses().is_empty());
    assert!(!bus_file.exists());

    let recovered: Vec<_> = db
        .record_containers()
        .iter()
        .filter(|meta| meta.sink_id == FileSinkId::RECOVERED)
        .collect();
    assert_eq!(recovered.len(), 1);

    let container = common::read_container(&dir.path().join(&recovered[0].path));
    assert!(container.finalized);

    let records: Vec<_> = container.records().collect();
    assert_eq!(records.len(), 3);
    for (severity, _) in &records {
        assert_eq!(**severity, Severity::WARN);
    }

    // Both spans made it across the recovery, parent links intact.
    let (outer_id, outer_parent) = container.span_start("recovery/outer").unwrap();
    assert!(!outer_parent.is_valid());
    let (inner_id, inner_parent) = container.span_start("recovery/inner").unwrap();
    assert_eq!(inner_parent, outer_id);
    assert_eq!(inner_id.trace_id, outer_id.trace_id);
    assert_ne!(inner_id.span_id, outer_id.span_id);
}

#[test]
fn prune_keeps_buses_of_living_processes() {
    let dir = TempDir::new().unwrap();
    let mut db = FileDatabase::open(dir.path().join("live.drot")).unwrap();

    let bus = DbMpscBus::create(DbMpscBusConfig {
        database: &db,
        bus_id: "live".to_owned(),
        file_name_pattern: &format!("{}/live.{{id}}.{{ctr}}.dmpscb", dir.path().display()),
        num_regions: 1,
        region_size: 4096,
    })
    .unwrap();

    // The bus handle is alive and holds its lock: prune must not touch it.
    db.prune_message_buses(None).unwrap();
    assert_eq!(db.message_buses().len(), 1);

    bus.unlink().unwrap();
    db.fetch_content().unwrap();
    assert!(db.message_buses().is_empty());
}
