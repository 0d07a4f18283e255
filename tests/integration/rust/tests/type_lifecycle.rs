//! Resolution lifecycle, field layout and constant-value tests.

use integration_tests::{flags, ClassBuilder, TestVm};
use type_system::ResolutionStatus;

#[test]
fn test_status_progresses_monotonically() {
    let mut b = ClassBuilder::new("pkg/A", Some("java/lang/Object"));
    b.method(
        flags::ACC_PUBLIC | flags::ACC_STATIC,
        "zero",
        "()I",
        1,
        0,
        vec![0x03, 0xac], // iconst_0; ireturn
    );
    let t = TestVm::boot(vec![("pkg/A", b.build())]);

    let name = t.name("pkg/A");
    let class = t.loader.load_class(&name).unwrap();
    assert_eq!(class.status(), ResolutionStatus::Loaded);

    class.resolve().unwrap();
    assert_eq!(class.status(), ResolutionStatus::Resolved);
    class.resolve().unwrap(); // idempotent
    assert_eq!(class.status(), ResolutionStatus::Resolved);

    class.initialise().unwrap();
    assert_eq!(class.status(), ResolutionStatus::Inited);
    class.initialise().unwrap();
    assert_eq!(class.status(), ResolutionStatus::Inited);
}

#[test]
fn test_fields_packed_largest_first() {
    let mut b = ClassBuilder::new("pkg/Packed", Some("java/lang/Object"));
    b.field(flags::ACC_PUBLIC, "a", "J")
        .field(flags::ACC_PUBLIC, "b", "I")
        .field(flags::ACC_PUBLIC, "c", "B")
        .field(flags::ACC_PUBLIC, "d", "S")
        .field(flags::ACC_PUBLIC, "e", "D");
    let t = TestVm::boot(vec![("pkg/Packed", b.build())]);
    let class = t.class("pkg/Packed");

    let offset = |name: &str| {
        class
            .find_virtual_field(&t.name(name))
            .unwrap()
            .unwrap()
            .offset()
    };
    // Buckets by descending log-size: J and D, then I, then S, then B.
    assert_eq!(offset("a"), 0);
    assert_eq!(offset("e"), 8);
    assert_eq!(offset("b"), 16);
    assert_eq!(offset("d"), 20);
    assert_eq!(offset("c"), 22);
    assert_eq!(class.struct_size().unwrap(), 23);
}

#[test]
fn test_subclass_fields_start_after_aligned_super() {
    let mut base = ClassBuilder::new("pkg/Base", Some("java/lang/Object"));
    base.field(flags::ACC_PUBLIC, "x", "B");
    let mut derived = ClassBuilder::new("pkg/Derived", Some("pkg/Base"));
    derived.field(flags::ACC_PUBLIC, "y", "I");

    let t = TestVm::boot(vec![
        ("pkg/Base", base.build()),
        ("pkg/Derived", derived.build()),
    ]);
    let derived = t.class("pkg/Derived");

    let y = derived
        .find_virtual_field(&t.name("y"))
        .unwrap()
        .unwrap();
    // Base occupies one byte, rounded up to the word size.
    assert_eq!(y.offset(), 8);
    // Inherited fields stay visible through the subclass.
    let x = derived
        .find_virtual_field(&t.name("x"))
        .unwrap()
        .unwrap();
    assert_eq!(x.offset(), 0);
}

#[test]
fn test_missing_class_is_not_found() {
    let t = TestVm::boot(vec![]);
    let err = t.loader.load_class(&t.name("no/Such")).unwrap_err();
    assert_eq!(
        err,
        core_types::VmError::ClassNotFound("no/Such".to_string())
    );
}

#[test]
fn test_bad_magic_is_a_format_error() {
    let t = TestVm::boot(vec![("pkg/Broken", vec![0, 1, 2, 3, 4, 5, 6, 7])]);
    let class = t.loader.load_class(&t.name("pkg/Broken")).unwrap();
    let err = class.resolve().unwrap_err();
    assert!(matches!(err, core_types::VmError::ClassFormat { .. }));
}

#[test]
fn test_unresolved_super_fails_resolution() {
    let b = ClassBuilder::new("pkg/Orphan", Some("pkg/Missing"));
    let t = TestVm::boot(vec![("pkg/Orphan", b.build())]);
    let class = t.loader.load_class(&t.name("pkg/Orphan")).unwrap();
    assert!(class.resolve().is_err());
    // No rollback: the failed class stays registered, still unresolved.
    assert_eq!(class.status(), ResolutionStatus::Loaded);
}

#[test]
fn test_circular_hierarchy_is_rejected() {
    let a = ClassBuilder::new("pkg/CircA", Some("pkg/CircB"));
    let b = ClassBuilder::new("pkg/CircB", Some("pkg/CircA"));
    let t = TestVm::boot(vec![("pkg/CircA", a.build()), ("pkg/CircB", b.build())]);
    let class = t.loader.load_class(&t.name("pkg/CircA")).unwrap();
    let err = class.resolve().unwrap_err();
    assert!(matches!(err, core_types::VmError::ClassFormat { .. }));
}

#[test]
fn test_define_is_idempotent_per_name() {
    let b = ClassBuilder::new("pkg/Once", Some("java/lang/Object"));
    let bytes = b.build();
    let t = TestVm::boot(vec![("pkg/Once", bytes.clone())]);
    let first = t.loader.load_class(&t.name("pkg/Once")).unwrap();
    let second = t.loader.define_class(&t.name("pkg/Once"), bytes).unwrap();
    assert!(std::sync::Arc::ptr_eq(&first, &second));
}

#[test]
fn test_constant_values_applied_at_initialise() {
    let mut b = ClassBuilder::new("pkg/Consts", Some("java/lang/Object"));
    b.const_int_field("ANSWER", 42);
    b.const_long_field("BIG", 1 << 40);
    let t = TestVm::boot(vec![("pkg/Consts", b.build())]);
    let class = t.class("pkg/Consts");
    class.initialise().unwrap();

    let statics = class.statics().unwrap();
    let answer = class
        .static_layout()
        .unwrap()
        .find_field(&t.name("ANSWER"))
        .unwrap();
    let big = class
        .static_layout()
        .unwrap()
        .find_field(&t.name("BIG"))
        .unwrap();
    assert_eq!(statics.get_i32(answer.offset()), 42);
    assert_eq!(statics.get_i64(big.offset()), 1 << 40);
}

#[test]
fn test_is_assignable_forces_resolution() {
    let b = ClassBuilder::new("pkg/Lazy", Some("java/lang/Object"));
    let t = TestVm::boot(vec![("pkg/Lazy", b.build())]);
    let class = t.loader.load_class(&t.name("pkg/Lazy")).unwrap();
    assert_eq!(class.status(), ResolutionStatus::Loaded);

    let ty = type_system::Type::Class(class.clone());
    let object = type_system::Type::Class(t.vm.object_class().unwrap());
    assert!(ty.is_assignable_to(&object).unwrap());
    assert_eq!(class.status(), ResolutionStatus::Resolved);
}
