//! Property tests for the call signature codec and the signature table

use iorecorder::cst::CallSignatureTable;
use iorecorder::error::RecorderError;
use iorecorder::record::CallEvent;
use iorecorder::signature::{canonical_arg, decode_key, encode_key, KeyProjection, NULL_ARG};
use proptest::prelude::*;

fn arg_strategy() -> impl Strategy<Value = Option<String>> {
    prop_oneof![
        1 => Just(None),
        8 => "[a-zA-Z0-9_./ -]{0,24}".prop_map(Some),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_decode_recovers_fields(
        thread_id in any::<u64>(),
        func_id in any::<i32>(),
        depth in any::<u8>(),
        args in prop::collection::vec(arg_strategy(), 0..8),
    ) {
        let mut event = CallEvent::new(thread_id, func_id, args.clone(), 0.0);
        event.depth = depth;
        let projection = KeyProjection { thread_id: true, depth: true };

        let decoded = decode_key(&encode_key(&event, projection)).unwrap();
        prop_assert_eq!(decoded.thread_id, thread_id);
        prop_assert_eq!(decoded.func_id, func_id);
        prop_assert_eq!(decoded.depth, depth);

        let expected: Vec<String> = args.iter().map(|a| canonical_arg(a.as_deref()).into_owned()).collect();
        prop_assert_eq!(decoded.args, expected);
    }

    #[test]
    fn prop_projection_drops_fields(
        thread_id in 1u64..,
        depth in 1u8..,
        args in prop::collection::vec(arg_strategy(), 0..4),
    ) {
        let mut event = CallEvent::new(thread_id, 9, args, 0.0);
        event.depth = depth;
        let projection = KeyProjection { thread_id: false, depth: false };

        let decoded = decode_key(&encode_key(&event, projection)).unwrap();
        prop_assert_eq!(decoded.thread_id, 0);
        prop_assert_eq!(decoded.depth, 0);
    }

    #[test]
    fn prop_truncated_key_is_rejected(
        args in prop::collection::vec("[a-z]{1,8}", 1..5),
        cut in 1usize..8,
    ) {
        let event = CallEvent::with_args(0, 3, args, 0.0);
        let key = encode_key(&event, KeyProjection::default());
        let cut = cut.min(key.len());
        let result = decode_key(&key[..key.len() - cut]);
        prop_assert!(matches!(result, Err(RecorderError::MalformedKey(_))));
    }

    #[test]
    fn prop_intern_is_idempotent(keys in prop::collection::vec("[a-d]{1,3}", 1..64)) {
        let mut cst = CallSignatureTable::new(0);
        let ids: Vec<i32> = keys.iter().map(|k| cst.intern(k.as_bytes())).collect();

        for (key, id) in keys.iter().zip(&ids) {
            let signature = cst.get(key.as_bytes()).unwrap();
            prop_assert_eq!(signature.terminal_id, *id);
            let occurrences = keys.iter().filter(|k| *k == key).count() as u32;
            prop_assert_eq!(signature.count, occurrences);
        }
        prop_assert_eq!(cst.total_calls(), keys.len() as u64);
        prop_assert_eq!(CallSignatureTable::deserialize(&cst.serialize(), 0).unwrap().len(), cst.len());
    }
}

#[test]
fn test_null_argument_becomes_sentinel() {
    let event = CallEvent::new(0, 1, vec![Some("a b".into()), None], 0.0);
    let decoded = decode_key(&encode_key(&event, KeyProjection::default())).unwrap();
    assert_eq!(decoded.args, vec!["a_b".to_string(), NULL_ARG.to_string()]);
}
