//! Subtype-check engine and virtual-table structure tests.

use integration_tests::{flags, ClassBuilder, TestVm};
use type_system::Type;

fn empty_class(name: &str, super_name: &str) -> Vec<u8> {
    ClassBuilder::new(name, Some(super_name)).build()
}

fn interface(name: &str, methods: &[(&str, &str)]) -> Vec<u8> {
    let mut b = ClassBuilder::new(name, Some("java/lang/Object"));
    b.access(flags::ACC_PUBLIC | flags::ACC_INTERFACE | flags::ACC_ABSTRACT);
    for (method, desc) in methods {
        b.bodyless_method(flags::ACC_PUBLIC | flags::ACC_ABSTRACT, method, desc);
    }
    b.build()
}

fn hierarchy_vm() -> TestVm {
    let mut x = ClassBuilder::new("pkg/X", Some("pkg/C"));
    x.implements("pkg/I");
    x.method(
        flags::ACC_PUBLIC,
        "bar",
        "()I",
        1,
        1,
        vec![0x03, 0xac], // iconst_0; ireturn
    );
    TestVm::boot(vec![
        ("pkg/A", empty_class("pkg/A", "java/lang/Object")),
        ("pkg/B", empty_class("pkg/B", "pkg/A")),
        ("pkg/C", empty_class("pkg/C", "pkg/B")),
        ("pkg/I", interface("pkg/I", &[("bar", "()I")])),
        ("pkg/X", x.build()),
    ])
}

fn ty(t: &TestVm, name: &str) -> Type {
    Type::Class(t.class(name))
}

fn assignable(a: &Type, b: &Type) -> bool {
    a.is_assignable_to(b).unwrap()
}

#[test]
fn test_reflexivity() {
    let t = hierarchy_vm();
    for name in ["pkg/A", "pkg/B", "pkg/C", "pkg/I", "pkg/X"] {
        let v = ty(&t, name);
        assert!(assignable(&v, &v), "{} <: {}", name, name);
    }
}

#[test]
fn test_transitivity_and_antisymmetry() {
    let t = hierarchy_vm();
    let a = ty(&t, "pkg/A");
    let b = ty(&t, "pkg/B");
    let c = ty(&t, "pkg/C");

    assert!(assignable(&c, &b));
    assert!(assignable(&b, &a));
    assert!(assignable(&c, &a)); // transitive

    assert!(!assignable(&a, &b));
    assert!(!assignable(&b, &c));
    assert!(!assignable(&a, &c));
}

#[test]
fn test_interfaces_are_secondary_supertypes() {
    let t = hierarchy_vm();
    let x = ty(&t, "pkg/X");
    let i = ty(&t, "pkg/I");
    let a = ty(&t, "pkg/A");

    assert!(assignable(&x, &i));
    assert!(assignable(&x, &a));
    assert!(!assignable(&i, &x));
    assert!(!assignable(&a, &i));

    // Interfaces sit in the secondary set, not on the display.
    assert!(!i.vt().unwrap().is_primary());
    assert!(x.vt().unwrap().is_primary());
}

#[test]
fn test_deep_chains_overflow_into_the_secondary_set() {
    let mut classes = Vec::new();
    let mut parent = "java/lang/Object".to_string();
    for depth in 0..12 {
        let name = format!("deep/D{}", depth);
        classes.push((name.clone(), empty_class(&name, &parent)));
        parent = name;
    }
    let borrowed: Vec<(&str, Vec<u8>)> = classes
        .iter()
        .map(|(n, b)| (n.as_str(), b.clone()))
        .collect();
    let t = TestVm::boot(borrowed);

    let bottom = ty(&t, "deep/D11");
    assert!(!bottom.vt().unwrap().is_primary());
    for depth in 0..12 {
        let ancestor = ty(&t, &format!("deep/D{}", depth));
        assert!(assignable(&bottom, &ancestor), "D11 <: D{}", depth);
        if depth < 11 {
            assert!(!assignable(&ancestor, &bottom));
        }
    }

    // The one-entry cache answers a repeated secondary query.
    let d9 = ty(&t, "deep/D9");
    assert!(assignable(&bottom, &d9));
    assert!(assignable(&bottom, &d9));
}

#[test]
fn test_vtable_slots_inherit_then_override() {
    let mut base = ClassBuilder::new("pkg/VBase", Some("java/lang/Object"));
    base.method(flags::ACC_PUBLIC, "one", "()I", 1, 1, vec![0x04, 0xac]);
    base.method(flags::ACC_PUBLIC, "two", "()I", 1, 1, vec![0x05, 0xac]);
    let mut derived = ClassBuilder::new("pkg/VDerived", Some("pkg/VBase"));
    derived.method(flags::ACC_PUBLIC, "two", "()I", 1, 1, vec![0x06, 0xac]);
    derived.method(flags::ACC_PUBLIC, "three", "()I", 1, 1, vec![0x07, 0xac]);

    let t = TestVm::boot(vec![
        ("pkg/VBase", base.build()),
        ("pkg/VDerived", derived.build()),
    ]);
    let base = t.class("pkg/VBase");
    let derived = t.class("pkg/VDerived");
    let base_vt = base.vt().unwrap();
    let derived_vt = derived.vt().unwrap();

    assert_eq!(base_vt.method_count(), 2);
    assert_eq!(derived_vt.method_count(), 3);

    // Every slot valid in the superclass table holds either the
    // superclass's method or the subclass's override.
    for slot in 0..base_vt.method_count() {
        let in_base = base_vt.method_at(slot).unwrap();
        let in_derived = derived_vt.method_at(slot).unwrap();
        let same = std::sync::Arc::ptr_eq(in_base, in_derived);
        let overridden = std::sync::Arc::ptr_eq(&in_derived.class(), &derived);
        assert!(same || overridden, "slot {} is foreign", slot);
    }

    // The override shares its slot index with the overridden method.
    let two_base = base
        .find_virtual_method(&t.name("two"), &t.name("()I"))
        .unwrap()
        .unwrap();
    let two_derived = derived
        .find_virtual_method(&t.name("two"), &t.name("()I"))
        .unwrap()
        .unwrap();
    assert_eq!(two_base.slot(), two_derived.slot());
    assert!(!std::sync::Arc::ptr_eq(&two_base, &two_derived));
}

#[test]
fn test_shared_interface_method_identity_shares_a_bucket() {
    let mut x = ClassBuilder::new("pkg/Both", Some("java/lang/Object"));
    x.implements("pkg/I1");
    x.implements("pkg/I2");
    x.method(flags::ACC_PUBLIC, "bar", "()I", 1, 1, vec![0x10, 7, 0xac]); // bipush 7
    let t = TestVm::boot(vec![
        ("pkg/I1", interface("pkg/I1", &[("bar", "()I")])),
        ("pkg/I2", interface("pkg/I2", &[("bar", "()I")])),
        ("pkg/Both", x.build()),
    ]);

    let both = t.class("pkg/Both");
    let slots = t.vm.options().interface_table_slots;
    let index =
        t.loader.interface_slot_index(&t.name("bar"), &t.name("()I")) as usize % slots;
    let slot = both.vt().unwrap().interface_slot(index).unwrap().methods().len();
    // Both interfaces declare the same (name, descriptor), so the
    // bucket holds exactly the one concrete implementation.
    assert_eq!(slot, 1);
}

#[test]
fn test_super_interfaces_flatten_transitively() {
    // J extends I; X implements only J, yet X <: I must hold.
    let mut j = ClassBuilder::new("pkg/J", Some("java/lang/Object"));
    j.access(flags::ACC_PUBLIC | flags::ACC_INTERFACE | flags::ACC_ABSTRACT);
    j.implements("pkg/I0");
    let mut x = ClassBuilder::new("pkg/XJ", Some("java/lang/Object"));
    x.implements("pkg/J");

    let t = TestVm::boot(vec![
        ("pkg/I0", interface("pkg/I0", &[])),
        ("pkg/J", j.build()),
        ("pkg/XJ", x.build()),
    ]);
    let x = ty(&t, "pkg/XJ");
    let j = ty(&t, "pkg/J");
    let i0 = ty(&t, "pkg/I0");

    assert!(assignable(&x, &j));
    assert!(assignable(&j, &i0));
    assert!(assignable(&x, &i0));
}

#[test]
fn test_object_array_covariance() {
    let t = TestVm::boot(vec![
        ("pkg/Num", empty_class("pkg/Num", "java/lang/Object")),
        ("pkg/Intg", empty_class("pkg/Intg", "pkg/Num")),
    ]);
    let num = ty(&t, "pkg/Num");
    let intg = ty(&t, "pkg/Intg");
    let object = Type::Class(t.vm.object_class().unwrap());

    let num_arr = num.array_type(1).unwrap();
    let intg_arr = intg.array_type(1).unwrap();
    let num_arr2 = num.array_type(2).unwrap();
    let intg_arr2 = intg.array_type(2).unwrap();

    assert!(assignable(&intg_arr, &num_arr));
    assert!(!assignable(&num_arr, &intg_arr));
    assert!(assignable(&intg_arr2, &num_arr2));
    assert!(assignable(&intg_arr, &object));
    // Same-depth covariance only: Intg[][] is an Object[], not vice versa.
    let obj_arr = object.array_type(1).unwrap();
    assert!(assignable(&intg_arr2, &obj_arr));
    assert!(!assignable(&obj_arr, &intg_arr2));
}

#[test]
fn test_primitive_arrays() {
    let t = TestVm::boot(vec![]);
    let int_ty = Type::Primitive(t.vm.primitive(core_types::PrimitiveKind::Int).unwrap());
    let long_ty = Type::Primitive(t.vm.primitive(core_types::PrimitiveKind::Long).unwrap());
    let object = Type::Class(t.vm.object_class().unwrap());

    let int_arr = int_ty.array_type(1).unwrap();
    let long_arr = long_ty.array_type(1).unwrap();

    assert!(assignable(&int_arr, &object));
    assert!(!assignable(&int_arr, &long_arr));
    assert!(!assignable(&object, &int_arr));

    // int[][] is an Object[] (primitive arrays are objects).
    let int_arr2 = int_ty.array_type(2).unwrap();
    let obj_arr = object.array_type(1).unwrap();
    assert!(assignable(&int_arr2, &obj_arr));
}

#[test]
fn test_arrays_implement_the_array_interfaces() {
    let t = TestVm::boot(vec![
        (
            "java/lang/Cloneable",
            interface("java/lang/Cloneable", &[]),
        ),
        (
            "java/io/Serializable",
            interface("java/io/Serializable", &[]),
        ),
        ("pkg/P", empty_class("pkg/P", "java/lang/Object")),
    ]);
    let cloneable = ty(&t, "java/lang/Cloneable");
    let serializable = ty(&t, "java/io/Serializable");
    let int_ty = Type::Primitive(t.vm.primitive(core_types::PrimitiveKind::Int).unwrap());
    let p = ty(&t, "pkg/P");

    let int_arr = int_ty.array_type(1).unwrap();
    let p_arr = p.array_type(1).unwrap();

    assert!(assignable(&int_arr, &cloneable));
    assert!(assignable(&int_arr, &serializable));
    // Object arrays reach the interfaces through the Object[] chain.
    assert!(assignable(&p_arr, &cloneable));
    assert!(assignable(&p_arr, &serializable));
}

#[test]
fn test_covariant_interface_arrays() {
    let t = TestVm::boot(vec![
        ("pkg/Cmp", interface("pkg/Cmp", &[])),
        ("pkg/Vals", {
            let mut b = ClassBuilder::new("pkg/Vals", Some("java/lang/Object"));
            b.implements("pkg/Cmp");
            b.build()
        }),
    ]);
    let cmp = ty(&t, "pkg/Cmp");
    let vals = ty(&t, "pkg/Vals");

    let cmp_arr = cmp.array_type(1).unwrap();
    let vals_arr = vals.array_type(1).unwrap();
    assert!(assignable(&vals_arr, &cmp_arr));
    assert!(!assignable(&cmp_arr, &vals_arr));
}
