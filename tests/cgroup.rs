use std::path::Path;

use oci::{CgroupBackend, Error, MemCgroups};

#[test]
fn test_create_with_parents() {
    let cgroups = MemCgroups::new();
    cgroups.create(Path::new("oci/r7")).unwrap();
    assert!(cgroups.contains(Path::new("oci")));
    assert!(cgroups.contains(Path::new("oci/r7")));
    assert!(!cgroups.contains(Path::new("oci/r8")));
}

#[test]
fn test_set_cpus() {
    let cgroups = MemCgroups::new();
    cgroups.create(Path::new("oci/r7")).unwrap();
    assert_eq!(cgroups.cpus(Path::new("oci/r7")), None);
    cgroups.set_cpus(Path::new("oci/r7"), &[2, 3]).unwrap();
    assert_eq!(cgroups.cpus(Path::new("oci/r7")), Some("2-3".into()));
    cgroups.set_cpus(Path::new("oci/r7"), &[1, 3]).unwrap();
    assert_eq!(cgroups.cpus(Path::new("oci/r7")), Some("1,3".into()));
}

#[test]
fn test_set_cpus_unknown_cgroup() {
    let cgroups = MemCgroups::new();
    match cgroups.set_cpus(Path::new("oci/r7"), &[0]) {
        Err(Error::Cgroup(msg)) => assert!(msg.contains("no such cgroup"), "{msg}"),
        v => panic!("expected cgroup error, got {v:?}"),
    }
}
