use oci::{build_id_maps, find_subid_range, IdMapEntry, User, UserKind};

mod common;

use common::TempDir;

#[test]
fn test_find_subid_first_match() {
    let tmpdir = TempDir::new().unwrap();
    let path = tmpdir.join("subuid");
    std::fs::write(
        &path,
        "root:0:4294967295\nalice:100000:65536\nalice:300000:1000\n",
    )
    .unwrap();
    assert_eq!(
        find_subid_range(&path, "alice").unwrap(),
        Some((100000, 65536))
    );
    assert_eq!(find_subid_range(&path, "root").unwrap(), Some((0, 4294967295)));
    assert_eq!(find_subid_range(&path, "bob").unwrap(), None);
}

#[test]
fn test_find_subid_skips_bad_lines() {
    let tmpdir = TempDir::new().unwrap();
    let path = tmpdir.join("subuid");
    std::fs::write(
        &path,
        "alice:garbage:100\nalice:100000\n# comment\nalice:200000:500\n",
    )
    .unwrap();
    assert_eq!(
        find_subid_range(&path, "alice").unwrap(),
        Some((200000, 500))
    );
}

#[test]
fn test_build_id_maps_master_layout() {
    let current = User {
        uid: 1000,
        gid: 1000,
    };
    let first_mapped = User {
        uid: 100000,
        gid: 200000,
    };
    let desc = [
        (UserKind::Superroot, 1),
        (UserKind::Root, 1000),
        (UserKind::User, 1),
    ];
    let (uid_map, gid_map) = build_id_maps(&desc, current, first_mapped);
    assert_eq!(
        uid_map,
        [
            IdMapEntry {
                container_id: 0,
                host_id: 1000,
                size: 1
            },
            IdMapEntry {
                container_id: 1,
                host_id: 100000,
                size: 1000
            },
            IdMapEntry {
                container_id: 1001,
                host_id: 101000,
                size: 1
            },
        ]
    );
    assert_eq!(gid_map[0].host_id, 1000);
    assert_eq!(gid_map[1].host_id, 200000);
    assert_eq!(gid_map[2].host_id, 201000);
}
