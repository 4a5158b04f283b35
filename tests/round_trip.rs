//! Values passed through an identity function come back intact under each
//! transfer mode.

mod common;

use common::{function_chunk, identity, init_tracing, numbers, type_of};
use vmbridge::config::BridgeConfig;
use vmbridge::{Bridge, BridgeError, HostValue, StateKey, Vector};

fn identity_handle(bridge: &Bridge) -> HostValue {
    bridge
        .func_create(&function_chunk("identity", identity), None)
        .unwrap()
}

fn echo(bridge: &Bridge, value: HostValue, acode: &str) -> HostValue {
    let f = identity_handle(bridge);
    bridge.func_call(&f, &[value], acode, None).unwrap()
}

#[test]
fn test_scalars_simplify() {
    init_tracing();
    let bridge = Bridge::new();
    assert_eq!(echo(&bridge, HostValue::from(2.5), "s"), HostValue::from(2.5));
    assert_eq!(echo(&bridge, HostValue::from(true), "s"), HostValue::from(true));
    assert_eq!(echo(&bridge, HostValue::from("hi"), "s"), HostValue::from("hi"));
    // Integers arrive as VM numbers.
    assert_eq!(numbers(&echo(&bridge, HostValue::from(7), "s")), vec![7.0]);
    assert_eq!(echo(&bridge, HostValue::Null, "s"), HostValue::Null);
    assert_eq!(bridge.stack_depth(None).unwrap(), 0);
}

#[test]
fn test_empty_vector_is_nil() {
    let bridge = Bridge::new();
    let f = bridge
        .func_create(&function_chunk("type", type_of), None)
        .unwrap();
    let empty = HostValue::numeric([]);
    let t = bridge.func_call(&f, &[empty.clone()], "s", None).unwrap();
    assert_eq!(t, HostValue::from("nil"));
    let t = bridge.func_call(&f, &[empty], "a", None).unwrap();
    assert_eq!(t, HostValue::from("nil"));
    let t = bridge
        .func_call(&f, &[HostValue::from(1.0)], "a", None)
        .unwrap();
    assert_eq!(t, HostValue::from("table"));
}

#[test]
fn test_vector_as_table() {
    let bridge = Bridge::new();
    let back = echo(&bridge, HostValue::numeric([1.0, 2.0, 3.0]), "s");
    let list = back.as_list().unwrap();
    assert_eq!(list.len(), 3);
    assert_eq!(list.items[2], HostValue::from(3.0));
    assert!(back.names().is_none());
}

#[test]
fn test_named_vector_as_table() {
    let bridge = Bridge::new();
    let x = HostValue::numeric([1.0, 2.0, 3.0]).with_names(["a", "b", "a"]);
    let back = echo(&bridge, x, "s");
    let list = back.as_list().unwrap();
    assert_eq!(list.len(), 2);
    // First occurrence of a repeated name wins.
    assert_eq!(list.get_named("a"), Some(&HostValue::from(1.0)));
    assert_eq!(list.get_named("b"), Some(&HostValue::from(2.0)));
}

#[test]
fn test_vector_copy() {
    let bridge = Bridge::new();
    let x = HostValue::numeric([1.0, f64::NAN, 3.0]);
    let back = echo(&bridge, x.clone(), "v");
    let values = numbers(&back);
    assert_eq!(values[0], 1.0);
    assert!(values[1].is_nan());
    assert_eq!(values[2], 3.0);
    if let (HostValue::Numeric(a), HostValue::Numeric(b)) = (&x, &back) {
        assert!(!a.values.same_storage(&b.values));
    }
}

#[test]
fn test_missing_scalars_survive_simplify() {
    let bridge = Bridge::new();
    let nan = echo(&bridge, HostValue::numeric([f64::NAN]), "s");
    assert!(numbers(&nan)[0].is_nan());
    // Integers arrive as VM numbers, so NA comes back as numeric NA.
    let na_int = echo(&bridge, HostValue::Integer(Vector::new(vec![None])), "s");
    assert!(numbers(&na_int)[0].is_nan());
    let na_str = echo(&bridge, HostValue::Character(Vector::new(vec![None])), "s");
    assert_eq!(na_str.as_character(), Some(vec![None]));
    assert_ne!(na_int, HostValue::Null);
}

#[test]
fn test_missing_elements_keep_positions() {
    let bridge = Bridge::new();
    let back = echo(&bridge, HostValue::numeric([1.0, f64::NAN, 3.0]), "a");
    let list = back.as_list().unwrap();
    assert_eq!(list.len(), 3);
    assert_eq!(numbers(&list.items[0]), vec![1.0]);
    assert!(numbers(&list.items[1])[0].is_nan());
    assert_eq!(numbers(&list.items[2]), vec![3.0]);

    let x = HostValue::Logical(Vector::new(vec![Some(true), None, Some(false)]));
    let back = echo(&bridge, x, "s");
    let list = back.as_list().unwrap();
    assert_eq!(list.len(), 3);
    assert_eq!(list.items[0], HostValue::from(true));
    assert!(numbers(&list.items[1])[0].is_nan());
    assert_eq!(list.items[2], HostValue::from(false));

    let x = HostValue::Character(Vector::new(vec![
        None,
        Some("b".to_string()),
        None,
    ]));
    let back = echo(&bridge, x, "a");
    let list = back.as_list().unwrap();
    assert_eq!(list.len(), 3);
    assert_eq!(list.items[0].as_character(), Some(vec![None]));
    assert_eq!(list.items[1], HostValue::from("b"));
    assert_eq!(list.items[2].as_character(), Some(vec![None]));
}

#[test]
fn test_missing_elements_through_vector_copy() {
    let bridge = Bridge::new();
    let x = HostValue::Integer(Vector::new(vec![Some(1), None, Some(3)]));
    assert_eq!(echo(&bridge, x.clone(), "v").as_integer(), x.as_integer());
    let x = HostValue::Logical(Vector::new(vec![None, Some(true)]));
    assert_eq!(echo(&bridge, x.clone(), "v").as_logical(), x.as_logical());
}

#[test]
fn test_reference_shares_storage() {
    let bridge = Bridge::new();
    let x = HostValue::integer([4, 5, 6]);
    let back = echo(&bridge, x.clone(), "r");
    match (&x, &back) {
        (HostValue::Integer(a), HostValue::Integer(b)) => {
            assert!(a.values.same_storage(&b.values))
        }
        _ => panic!("expected integer vectors, got {:?}", back),
    }
}

#[test]
fn test_character_vector_with_na() {
    let bridge = Bridge::new();
    let x = HostValue::Character(Vector::new(vec![
        Some("x".to_string()),
        None,
        Some("z".to_string()),
    ]));
    let back = echo(&bridge, x.clone(), "v");
    assert_eq!(back.as_character(), x.as_character());
}

#[test]
fn test_named_list_through_reference() {
    let bridge = Bridge::new();
    let x = HostValue::named_list([
        ("alpha", HostValue::numeric([1.0, 2.0])),
        ("beta", HostValue::from("b")),
        ("gamma", HostValue::from(false)),
    ]);
    let back = echo(&bridge, x.clone(), "r");
    assert_eq!(back.names().unwrap(), vec!["alpha", "beta", "gamma"]);
    let list = back.as_list().unwrap();
    assert_eq!(list.get_named("beta"), Some(&HostValue::from("b")));
    assert_eq!(list.get_named("gamma"), Some(&HostValue::from(false)));
    assert_eq!(numbers(&list.items[0]), vec![1.0, 2.0]);
}

#[test]
fn test_nested_list_as_table() {
    let bridge = Bridge::new();
    let inner = HostValue::named_list([("depth", HostValue::from(2.0))]);
    let x = HostValue::named_list([("inner", inner), ("top", HostValue::from(1.0))]);
    let back = echo(&bridge, x, "s");
    let list = back.as_list().unwrap();
    let inner = list.get_named("inner").and_then(HostValue::as_list).unwrap();
    assert_eq!(inner.get_named("depth"), Some(&HostValue::from(2.0)));
}

#[test]
fn test_embedded_nul_returns_raw() {
    let bridge = Bridge::new();
    let raw = HostValue::raw(b"ab\0cd".to_vec());
    assert_eq!(echo(&bridge, raw.clone(), "s"), raw);
}

#[test]
fn test_external_address_round_trip() {
    let bridge = Bridge::new();
    let ptr = HostValue::address(0xdead_beef);
    assert_eq!(echo(&bridge, ptr.clone(), "s"), ptr);
}

#[test]
fn test_digit_code_checks_length() {
    let bridge = Bridge::new();
    let f = identity_handle(&bridge);
    let ok = bridge
        .func_call(&f, &[HostValue::numeric([1.0, 2.0])], "2", None)
        .unwrap();
    assert_eq!(ok.as_list().map(|l| l.len()), Some(2));
    let err = bridge
        .func_call(&f, &[HostValue::numeric([1.0, 2.0])], "3", None)
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Vector of length 3 requested, but passed vector of length 2."
    );
    assert_eq!(bridge.stack_depth(None).unwrap(), 0);
}

#[test]
fn test_string_ceiling_leaves_stack_unchanged() {
    let config = BridgeConfig::parse("[limits]\nmax_string_bytes = 8").unwrap();
    let bridge = Bridge::with_config(config);
    let f = identity_handle(&bridge);
    let err = bridge
        .func_call(&f, &[HostValue::from("far too long for the ceiling")], "s", None)
        .unwrap_err();
    assert!(matches!(err, BridgeError::SizeCeiling(_)));
    assert_eq!(bridge.stack_depth(Some(StateKey::DEFAULT)).unwrap(), 0);
}

#[test]
fn test_acode_cycles_over_arguments() {
    let bridge = Bridge::new();
    let f = bridge
        .func_create(&function_chunk("type", type_of), None)
        .unwrap();
    let args = [HostValue::numeric([1.0])];
    assert_eq!(
        bridge.func_call(&f, &args, "a", None).unwrap(),
        HostValue::from("table")
    );
    assert_eq!(
        bridge.func_call(&f, &args, "v", None).unwrap(),
        HostValue::from("cdata")
    );
    let err = bridge.func_call(&f, &args, "", None).unwrap_err();
    assert_eq!(err.to_string(), "Length of args code is zero.");
}
