//! Registry behaviour across handles

mod common;

use common::unique_names;
use guider_common::consts::{INVALID_INDEX, MAX_ITEMS};
use guider_common::prelude::*;
use guider_shm::{
    CameraAccess, CameraRegistry, MountRegistry, RegistryAccess, RegistryReader, ShmError,
    ShmResult,
};
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};

#[test]
fn test_select_then_shrink_deselects() -> ShmResult<()> {
    let names = unique_names("shrink");
    let cameras = CameraRegistry::attach(&names, true)?;
    assert_eq!(cameras.list_version()?, 0);
    assert_eq!(cameras.get_selected()?, INVALID_INDEX);

    cameras.update_list(&["CamA", "CamB"])?;
    assert_eq!(cameras.list_version()?, 1);
    assert_eq!(cameras.get_selected()?, INVALID_INDEX);

    assert!(cameras.set_selected(1)?);
    assert_eq!(cameras.selection_version()?, 1);
    assert_eq!(cameras.get_selected()?, 1);

    cameras.update_list(&["CamA"])?;
    assert_eq!(cameras.get_selected()?, INVALID_INDEX);
    assert_eq!(cameras.list_version()?, 2);
    assert_eq!(cameras.selection_version()?, 2);

    cameras.shutdown(true)
}

#[test]
fn test_shrink_keeping_selection_in_range() -> ShmResult<()> {
    let names = unique_names("keep");
    let mounts = MountRegistry::attach(&names, true)?;
    mounts.update_list(&["A", "B", "C"])?;
    mounts.set_selected(0)?;

    mounts.update_list(&["A", "B"])?;
    assert_eq!(mounts.get_selected()?, 0);
    assert_eq!(mounts.selection_version()?, 1);

    mounts.shutdown(true)
}

#[test]
fn test_out_of_range_selection_is_rejected() -> ShmResult<()> {
    let names = unique_names("range");
    let mounts = MountRegistry::attach(&names, true)?;
    mounts.update_list(&["EQMOD", "On-camera"])?;
    mounts.set_selected(0)?;

    let result = mounts.set_selected(2);
    assert!(matches!(
        result,
        Err(ShmError::InvalidIndex { index: 2, count: 2 })
    ));
    assert_eq!(mounts.get_selected()?, 0);
    assert_eq!(mounts.selection_version()?, 1);

    mounts.shutdown(true)
}

#[test]
fn test_repeated_selection_bumps_once() -> ShmResult<()> {
    let names = unique_names("twice");
    let mounts = MountRegistry::attach(&names, true)?;
    mounts.update_list(&["A", "B"])?;

    assert!(mounts.set_selected(1)?);
    assert!(!mounts.set_selected(1)?);
    assert_eq!(mounts.selection_version()?, 1);

    assert!(mounts.clear_selection()?);
    assert!(!mounts.clear_selection()?);
    assert_eq!(mounts.selection_version()?, 2);

    mounts.shutdown(true)
}

#[test]
fn test_failed_updates_leave_version_alone() -> ShmResult<()> {
    let names = unique_names("fail");
    let mounts = MountRegistry::attach(&names, true)?;
    mounts.update_list(&["Keep"])?;

    let too_many: Vec<String> = (0..=MAX_ITEMS).map(|i| format!("m{i}")).collect();
    assert!(matches!(
        mounts.update_list(&too_many),
        Err(ShmError::CapacityExceeded { .. })
    ));

    let too_long = "x".repeat(256);
    assert!(matches!(
        mounts.update_list(&["ok", too_long.as_str()]),
        Err(ShmError::InvalidName { .. })
    ));

    assert!(matches!(
        mounts.update_list(&["bad\0name"]),
        Err(ShmError::InvalidName { .. })
    ));

    assert_eq!(mounts.list_version()?, 1);
    assert_eq!(mounts.read_list(MAX_ITEMS)?, vec!["Keep".to_string()]);

    mounts.shutdown(true)
}

#[test]
fn test_full_list_and_longest_name_fit() -> ShmResult<()> {
    let names = unique_names("full");
    let mounts = MountRegistry::attach(&names, true)?;
    let longest = "n".repeat(255);
    let mut list: Vec<String> = (1..MAX_ITEMS).map(|i| format!("mount {i}")).collect();
    list.push(longest.clone());

    mounts.update_list(&list)?;
    let read = mounts.read_list(MAX_ITEMS)?;
    assert_eq!(read.len(), MAX_ITEMS);
    assert_eq!(read.last(), Some(&longest));

    mounts.shutdown(true)
}

#[test]
fn test_second_attach_sees_writes() -> ShmResult<()> {
    let names = unique_names("peer");
    let server = CameraRegistry::attach(&names, true)?;
    let client = CameraRegistry::attach(&names, false)?;
    assert!(server.is_owner());
    assert!(!client.is_owner());

    server.update_list(&["ZWO ASI120", "Simulator"])?;
    let snapshot = client.snapshot()?;
    assert_eq!(snapshot.class, EquipmentClass::Camera);
    assert_eq!(snapshot.items, vec!["ZWO ASI120", "Simulator"]);
    assert_eq!(snapshot.selected(), None);

    client.set_selected(1)?;
    assert_eq!(server.snapshot()?.selected_name(), Some("Simulator"));

    client.shutdown(true)?;
    assert_eq!(server.get_selected()?, 1);
    server.shutdown(true)
}

#[test]
fn test_client_request_reaches_server() -> ShmResult<()> {
    let names = unique_names("request");
    let server = MountRegistry::attach(&names, true)?;
    let client = MountRegistry::attach(&names, false)?;
    server.update_list(&["A", "B", "C"])?;

    let mut last_request = server.request_version()?;
    assert_eq!(server.take_request(&mut last_request)?, None);

    client.request_selection(2)?;
    assert!(matches!(
        client.request_selection(7),
        Err(ShmError::InvalidIndex { .. })
    ));

    let requested = server.take_request(&mut last_request)?;
    assert_eq!(requested, Some(2));
    assert_eq!(server.get_selected()?, INVALID_INDEX);
    if let Some(index) = requested {
        server.set_selected(index)?;
    }
    assert_eq!(server.take_request(&mut last_request)?, None);
    assert_eq!(client.get_selected()?, 2);

    client.shutdown(false)?;
    server.shutdown(true)
}

#[test]
fn test_reader_cannot_write() -> ShmResult<()> {
    let names = unique_names("reader");
    let server = MountRegistry::attach(&names, true)?;
    server.update_list(&["A"])?;

    let reader = RegistryReader::<MountListShm>::attach(&names)?;
    assert_eq!(reader.read_list(8)?, vec!["A".to_string()]);
    assert_eq!(reader.item_count()?, 1);

    let mut seen = 0;
    assert!(reader.has_list_changed(&mut seen)?);
    assert!(!reader.has_list_changed(&mut seen)?);

    let mut selection_seen = reader.selection_version()?;
    server.set_selected(0)?;
    assert!(reader.has_selection_changed(&mut selection_seen)?);
    assert!(!reader.has_selection_changed(&mut selection_seen)?);

    server.shutdown(true)
}

#[test]
fn test_retired_segment_fails_closed() -> ShmResult<()> {
    let names = unique_names("retire");
    let server = CameraRegistry::attach(&names, true)?;
    server.update_list(&["A"])?;
    let reader = RegistryReader::<CameraListShm>::attach(&names)?;

    server.shutdown(true)?;
    assert!(matches!(reader.get_selected(), Err(ShmError::Retired { .. })));
    assert!(matches!(reader.read_list(4), Err(ShmError::Retired { .. })));
    assert!(matches!(
        RegistryReader::<CameraListShm>::attach(&names),
        Err(ShmError::AttachFailed { .. })
    ));

    let fresh = CameraRegistry::attach(&names, true)?;
    assert!(fresh.is_owner());
    assert_eq!(fresh.list_version()?, 0);
    fresh.shutdown(true)
}

#[test]
fn test_missing_registry_without_create() {
    let names = unique_names("absent");
    let result = MountRegistry::attach(&names, false);
    assert!(matches!(result, Err(ref e) if e.is_unavailable()));
}

#[test]
fn test_camera_instances() -> ShmResult<()> {
    let names = unique_names("inst");
    let cameras = CameraRegistry::attach(&names, true)?;
    let reader = RegistryReader::<CameraListShm>::attach(&names)?;

    assert!(!reader.instance_selection_supported()?);
    assert_eq!(reader.selected_instance_id()?, "");

    cameras.set_instance_selection_supported(true)?;
    cameras.update_instances(&[("ASI294MC #1", "sn-1001"), ("ASI294MC #2", "sn-1002")])?;
    assert!(cameras.set_selected_instance_id("sn-1002")?);
    assert!(!cameras.set_selected_instance_id("sn-1002")?);

    assert!(reader.instance_selection_supported()?);
    assert_eq!(reader.selected_instance()?, ("sn-1002".to_string(), 2));
    let mut instance_seen = 1;
    assert!(reader.has_instance_changed(&mut instance_seen)?);
    assert!(!reader.has_instance_changed(&mut instance_seen)?);
    let instances = reader.instances()?;
    assert_eq!(instances.len(), 2);
    assert_eq!(instances[0].display_name, "ASI294MC #1");
    assert_eq!(instances[1].id, "sn-1002");

    let too_long = "i".repeat(300);
    assert!(cameras.set_selected_instance_id(&too_long).is_err());
    assert_eq!(reader.instance_version()?, 2);

    cameras.shutdown(true)
}

#[test]
fn test_reader_never_sees_mixed_lists() -> ShmResult<()> {
    const SHORT: [&str; 2] = ["A", "B"];
    const LONG: [&str; 5] = ["C1", "C2", "C3", "C4", "C5"];
    const ROUNDS: u32 = 400;

    let names = unique_names("mixed");
    let server = MountRegistry::attach(&names, true)?;
    server.update_list(&SHORT)?;
    let reader = RegistryReader::<MountListShm>::attach(&names)?;
    let done = AtomicBool::new(false);

    // Odd list versions carry SHORT, even ones LONG.
    std::thread::scope(|scope| -> ShmResult<()> {
        let writer = scope.spawn(|| -> ShmResult<()> {
            for round in 0..ROUNDS {
                if round % 2 == 0 {
                    server.update_list(&LONG)?;
                } else {
                    server.update_list(&SHORT)?;
                }
            }
            done.store(true, Ordering::Release);
            Ok(())
        });

        while !done.load(Ordering::Acquire) {
            match reader.snapshot() {
                Ok(snapshot) if snapshot.list_version % 2 == 1 => assert_eq!(snapshot.items, SHORT),
                Ok(snapshot) => assert_eq!(snapshot.items, LONG),
                Err(ShmError::ReadConflict { .. }) => {}
                Err(e) => return Err(e),
            }
            match reader.read_list(MAX_ITEMS) {
                Ok(list) => assert!(list == SHORT || list == LONG, "mixed list {list:?}"),
                Err(ShmError::ReadConflict { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        writer.join().expect("writer thread panicked")
    })?;

    let last = reader.snapshot()?;
    assert_eq!(last.list_version, ROUNDS + 1);
    assert_eq!(last.items, SHORT);

    server.shutdown(true)
}

#[test]
fn test_writers_on_separate_handles_do_not_collide() -> ShmResult<()> {
    let names = unique_names("writers");
    let server = CameraRegistry::attach(&names, true)?;
    server.update_list(&["A", "B", "C"])?;
    let client = CameraRegistry::attach(&names, false)?;

    std::thread::scope(|scope| {
        let requests = scope.spawn(|| -> ShmResult<()> {
            for i in 0..200u32 {
                client.request_selection(i % 3)?;
            }
            Ok(())
        });
        let selections = scope.spawn(|| -> ShmResult<()> {
            for i in 0..200u32 {
                server.set_selected(i % 3)?;
            }
            Ok(())
        });
        requests.join().expect("request thread panicked")?;
        selections.join().expect("selection thread panicked")
    })?;

    assert_eq!(server.request_version()?, 200);
    assert_eq!(server.header()?.write_seq.load(Ordering::Acquire) % 2, 0);
    let snapshot = server.snapshot()?;
    assert_eq!(snapshot.selected_index, 199 % 3);

    client.shutdown(false)?;
    server.shutdown(true)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_update_then_read_returns_names(
        list in prop::collection::vec("[a-zA-Z0-9 _.-]{0,255}", 0..=MAX_ITEMS)
    ) {
        let names = unique_names("prop");
        let mounts = MountRegistry::attach(&names, true).map_err(|e| TestCaseError::fail(e.to_string()))?;
        mounts.update_list(&list).map_err(|e| TestCaseError::fail(e.to_string()))?;
        let read = mounts.read_list(list.len()).map_err(|e| TestCaseError::fail(e.to_string()))?;
        let version = mounts.list_version().map_err(|e| TestCaseError::fail(e.to_string()))?;
        mounts.shutdown(true).map_err(|e| TestCaseError::fail(e.to_string()))?;

        prop_assert_eq!(read, list);
        prop_assert_eq!(version, 1);
    }
}
