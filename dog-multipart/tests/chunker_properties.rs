//! Property-based tests for the chunker

use bytes::Bytes;
use proptest::prelude::*;

use dog_multipart::{ChunkEvent, Chunker, MultipartError, MultipartResult, PartSpec, SizePolicy};

/// Small but valid policies: max >= 2 * min, max_object anywhere up to
/// what `max_part_count` parts of `max_part_size` can hold
fn policy() -> impl Strategy<Value = SizePolicy> {
    (1u64..16, 0u64..16, 0u64..32, 1u64..20, 1u64..=100).prop_map(|(min, extra, headroom, count, fill)| {
        let preferred = min + extra;
        let max = preferred.max(min * 2) + headroom;
        SizePolicy::new()
            .with_min_part_size(min)
            .with_preferred_part_size(preferred)
            .with_max_part_size(max)
            .with_max_part_count(count)
            .with_max_object_size((max * count * fill / 100).max(1))
    })
}

/// A policy, a length it allows, and the write sizes to feed it with
fn case() -> impl Strategy<Value = (SizePolicy, usize, Vec<usize>)> {
    policy().prop_flat_map(|policy| {
        let limit = policy.max_object_size as usize;
        (
            Just(policy),
            0..=limit,
            prop::collection::vec(1usize..50, 1..32),
        )
    })
}

fn data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

/// Feed `input` in writes of cycling `steps` sizes and rebuild every part
/// from the events, checking their order on the way
fn replay(mut chunker: Chunker, input: &[u8], steps: &[usize]) -> MultipartResult<Vec<(PartSpec, Vec<u8>)>> {
    let mut events = Vec::new();
    let mut offset = 0;
    for step in steps.iter().cycle() {
        if offset >= input.len() {
            break;
        }
        let end = (offset + step).min(input.len());
        events.extend(chunker.push(Bytes::copy_from_slice(&input[offset..end]))?);
        offset = end;
    }
    events.extend(chunker.finish()?);

    let mut parts = Vec::new();
    let mut current: Vec<u8> = Vec::new();
    let mut current_index = 0u32;
    for event in events {
        match event {
            ChunkEvent::Data { index, bytes } => {
                assert_eq!(index, current_index, "data for a part that is not open");
                current.extend_from_slice(&bytes);
            }
            ChunkEvent::Seal(spec) => {
                assert_eq!(spec.index, current_index, "parts sealed out of order");
                parts.push((spec, std::mem::take(&mut current)));
                current_index += 1;
            }
        }
    }
    assert!(current.is_empty(), "data left in an unsealed part");
    Ok(parts)
}

fn check_layout(policy: &SizePolicy, input: &[u8], parts: &[(PartSpec, Vec<u8>)]) {
    assert!(parts.len() as u64 <= policy.max_part_count);
    if input.is_empty() {
        assert!(parts.is_empty());
        return;
    }

    let mut offset = 0u64;
    let mut rebuilt = Vec::with_capacity(input.len());
    for (spec, bytes) in parts {
        assert_eq!(spec.offset, offset);
        assert_eq!(spec.size, bytes.len() as u64);
        assert!(spec.size <= policy.max_part_size);
        if parts.len() > 1 {
            assert!(spec.size >= policy.min_part_size, "part {:?} below minimum", spec);
        }
        offset += spec.size;
        rebuilt.extend_from_slice(bytes);
    }
    assert_eq!(offset, input.len() as u64);
    assert_eq!(rebuilt, input);
}

proptest! {
    #[test]
    fn props_declared_length_always_fits((policy, len, steps) in case()) {
        let input = data(len);
        let chunker = Chunker::new(policy.clone(), Some(len as u64)).unwrap();
        let parts = replay(chunker, &input, &steps).unwrap();
        check_layout(&policy, &input, &parts);
    }

    #[test]
    fn props_unknown_length_always_fits((policy, len, steps) in case()) {
        let input = data(len);
        let chunker = Chunker::new(policy.clone(), None).unwrap();
        let parts = replay(chunker, &input, &steps).unwrap();
        check_layout(&policy, &input, &parts);
    }

    #[test]
    fn props_unknown_length_rejects_one_byte_too_many((policy, steps) in (policy(), prop::collection::vec(1usize..50, 1..32))) {
        let input = data(policy.max_object_size as usize + 1);
        let chunker = Chunker::new(policy, None).unwrap();
        let err = replay(chunker, &input, &steps).unwrap_err();
        prop_assert!(matches!(err, MultipartError::SizeLimitExceeded { .. }), "{}", err);
    }

    #[test]
    fn props_plan_matches_declared_chunking((policy, len, steps) in case()) {
        let input = data(len);
        let plan = dog_multipart::chunker::plan_parts(&policy, len as u64).unwrap();
        let chunker = Chunker::new(policy.clone(), Some(len as u64)).unwrap();
        let sizes: Vec<u64> = replay(chunker, &input, &steps)
            .unwrap()
            .iter()
            .map(|(spec, _)| spec.size)
            .collect();
        prop_assert_eq!(sizes, plan);
    }

    #[test]
    fn props_too_long_declared_length_is_rejected(policy in policy(), extra in 1u64..100) {
        let declared = policy.max_object_size + extra;
        let err = Chunker::new(policy, Some(declared)).err().unwrap();
        prop_assert!(matches!(err, MultipartError::SizeLimitExceeded { .. }), "expected SizeLimitExceeded, got {:?}", err);
    }
}
