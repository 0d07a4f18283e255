//! Unit tests for the engine error taxonomy.

use core_types::VmError;

#[test]
fn test_class_format_display() {
    let err = VmError::format("pkg/C", "zero-sized constant pool");
    assert_eq!(
        err.to_string(),
        "class format error in pkg/C: zero-sized constant pool"
    );
}

#[test]
fn test_not_found_family() {
    assert_eq!(
        VmError::ClassNotFound("a/B".into()).to_string(),
        "class not found: a/B"
    );
    assert_eq!(
        VmError::NoClassDef("a/B".into()).to_string(),
        "no class definition found: a/B"
    );
}

#[test]
fn test_no_such_method_carries_the_triple() {
    let err = VmError::NoSuchMethod {
        class: "a/B".into(),
        name: "run".into(),
        descriptor: "()V".into(),
    };
    assert_eq!(err.to_string(), "no such method: a/B::run()V");
}

#[test]
fn test_errors_are_comparable() {
    assert_eq!(VmError::IllegalMonitorState, VmError::IllegalMonitorState);
    assert_ne!(
        VmError::internal("a"),
        VmError::ClassNotFound("a".to_string())
    );
}
