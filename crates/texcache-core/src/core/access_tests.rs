use super::CacheAccess;

#[test]
fn display() {
    assert_eq!(CacheAccess::empty().to_string(), "--");
    assert_eq!(CacheAccess::WRITE.to_string(), "-w");
    assert_eq!(CacheAccess::READ_WRITE.to_string(), "rw");
}
