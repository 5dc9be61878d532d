//! Property-based tests over the module builder: anonymous-prototype
//! dedup, id-uniqueness/`find` round-trip, and "a rejected mutation leaves
//! state unchanged".

use proptest::prelude::*;
use wasmforge::backend::binary::BinaryModule;
use wasmforge::{Exchange, Module, Param, ValType};

fn arb_val_type() -> impl Strategy<Value = ValType> {
    prop_oneof![
        Just(ValType::I32),
        Just(ValType::I64),
        Just(ValType::F32),
        Just(ValType::F64),
    ]
}

proptest! {
    #[test]
    fn anonymous_prototypes_with_same_shape_dedup(
        params in prop::collection::vec(arb_val_type(), 0..4),
        results in prop::collection::vec(arb_val_type(), 0..2),
    ) {
        let mut backend = BinaryModule::new();
        let mut module = Module::new(&mut backend);
        let a = module.declare_anonymous_prototype(&params, &results).unwrap();
        let b = module.declare_anonymous_prototype(&params, &results).unwrap();
        prop_assert_eq!(a, b);
        module.close().unwrap();
    }

    #[test]
    fn declared_ids_are_found_back(id in "[a-zA-Z_][a-zA-Z0-9_]{0,15}") {
        let mut backend = BinaryModule::new();
        let mut module = Module::new(&mut backend);
        let sig = module.declare_prototype(&id, vec![], vec![]).unwrap();
        prop_assert_eq!(module.find_prototype(&id), Some(sig));
        prop_assert_eq!(module.find_prototype("does-not-exist"), None);
        module.close().unwrap();
    }

    #[test]
    fn duplicate_id_is_rejected_without_mutating_state(id in "[a-zA-Z_][a-zA-Z0-9_]{0,15}") {
        let mut backend = BinaryModule::new();
        let mut module = Module::new(&mut backend);
        let first = module.declare_prototype(&id, vec![], vec![]).unwrap();

        let err = module.declare_prototype(&id, vec![Param::new(ValType::I32)], vec![]);
        prop_assert!(err.is_err());

        // The rejected call must not have registered a second prototype
        // under the same id, nor disturbed the first.
        prop_assert_eq!(module.find_prototype(&id), Some(first));
        module.close().unwrap();
    }

    #[test]
    fn function_without_id_cannot_be_exported(
        params in prop::collection::vec(arb_val_type(), 0..3),
    ) {
        let mut backend = BinaryModule::new();
        let mut module = Module::new(&mut backend);
        let sig = module
            .declare_prototype("sig", params.into_iter().map(Param::new).collect(), vec![])
            .unwrap();
        let err = module.declare_function(None, sig, Exchange::export());
        prop_assert!(err.is_err());
    }
}
