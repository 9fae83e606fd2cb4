//! Round trips against the on-disk backend, including a simulated crash
//! that tears the file behind the map's back.

use std::sync::Arc;

use lamina_config::testing::TestEnvironment;
use lamina_pathmap::{Pathmap, OPAQUE, WHITEOUT};
use lamina_store::DiskStore;

#[test]
fn disk_roundtrip() {
    let env = TestEnvironment::new().unwrap();
    let store = Arc::new(DiskStore::new(&env.project_root).unwrap());

    let pm = Pathmap::open(store.clone(), &env.map_file, false).unwrap();
    pm.set("/deleted/file", WHITEOUT);
    pm.set("/private", OPAQUE);
    pm.set("/cached", 1);
    assert!(pm.write(true).unwrap());
    drop(pm);

    assert!(env.map_path().exists());

    let pm = Pathmap::open(store, &env.map_file, false).unwrap();
    assert_eq!(pm.try_get("/deleted/file"), Some(WHITEOUT));
    assert_eq!(pm.try_get("/private"), Some(OPAQUE));
    assert_eq!(pm.try_get("/cached"), None);

    let (isopq, _) = pm.get("/private/anything");
    assert!(isopq);
}

#[test]
fn disk_crash_mid_record() {
    let env = TestEnvironment::new().unwrap();
    let store = Arc::new(DiskStore::new(&env.project_root).unwrap());

    let pm = Pathmap::open(store.clone(), &env.map_file, false).unwrap();
    pm.set("/a", WHITEOUT);
    pm.write(true).unwrap();
    pm.set("/b", WHITEOUT);
    pm.write(true).unwrap();
    drop(pm);

    // tear the file mid-record behind the map's back
    let raw = std::fs::read(env.map_path()).unwrap();
    assert_eq!(raw.len(), 64);
    std::fs::write(env.map_path(), &raw[..55]).unwrap();

    let pm = Pathmap::open(store, &env.map_file, false).unwrap();
    assert_eq!(pm.try_get("/a"), Some(WHITEOUT));
    assert_eq!(pm.try_get("/b"), None);
    assert_eq!(pm.log_len(), 48);
}

#[test]
fn disk_reopen_and_extend() {
    let env = TestEnvironment::new().unwrap();
    let store = Arc::new(DiskStore::new(&env.project_root).unwrap());

    for round in 0..3 {
        let pm = Pathmap::open(store.clone(), &env.map_file, false).unwrap();
        assert_eq!(pm.len(), round);
        pm.set(&format!("/file{round}"), WHITEOUT);
        assert!(pm.write(true).unwrap());
    }

    let pm = Pathmap::open(store, &env.map_file, false).unwrap();
    assert_eq!(pm.len(), 3);
    // three transactions of one header and one record each
    assert_eq!(pm.log_len(), 96);
}
