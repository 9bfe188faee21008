use super::{CacheLayout, KeyValueCache, KvCacheEntry};
use crate::core::AttentionError;
use candle_core::{DType, Device, Tensor};
use static_assertions::{assert_impl_all, assert_not_impl_any};

fn allclose(a: &Tensor, b: &Tensor, tol: f32) {
    assert_eq!(a.dims(), b.dims());
    let diff = a
        .to_dtype(DType::F32)
        .unwrap()
        .sub(&b.to_dtype(DType::F32).unwrap())
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();
    let max = diff.into_iter().fold(0.0_f32, |acc, v| acc.max(v));
    assert!(max <= tol, "max diff {max} exceeded tolerance {tol}");
}

fn layout(batch: usize, beam_width: usize, capacity: usize) -> CacheLayout {
    CacheLayout {
        batch,
        num_heads: 2,
        head_dim: 4,
        beam_width,
        capacity,
    }
}

fn random_block(device: &Device, rows: usize, len: usize) -> (Tensor, Tensor) {
    let keys = Tensor::rand(0.0f32, 1.0, (rows, 2, len, 4), device).unwrap();
    let values = Tensor::rand(0.0f32, 1.0, (rows, 2, len, 4), device).unwrap();
    (keys, values)
}

fn select_rows(tensor: &Tensor, selection: &[u32]) -> Tensor {
    let index = Tensor::new(selection, tensor.device()).unwrap();
    tensor.index_select(&index, 0).unwrap()
}

#[test]
fn lengths_grow_monotonically() {
    let device = Device::Cpu;
    let mut cache = KvCacheEntry::init_empty(layout(1, 1, 16), DType::F32, &device).unwrap();
    assert_eq!(cache.seq_len(), 0);
    let mut previous = 0;
    for len in [3, 1, 1, 2] {
        let (k, v) = random_block(&device, 1, len);
        cache.append(&k, &v, None).unwrap();
        assert_eq!(cache.seq_len(), previous + len);
        assert_eq!(cache.stored_len(), cache.seq_len());
        previous = cache.seq_len();
    }
    let (keys, values) = cache.window(2).unwrap();
    assert_eq!(keys.dims(), &[1, 2, 2, 4]);
    assert_eq!(values.dims(), &[1, 2, 2, 4]);
    assert_eq!(cache.seq_len(), 7);
    assert_eq!(cache.beam_index_tensor().unwrap().dims(), &[7, 1]);
}

#[test]
fn materialize_returns_appended_history() {
    let device = Device::Cpu;
    let mut cache = KvCacheEntry::init_empty(layout(2, 1, 8), DType::F32, &device).unwrap();
    let (k0, v0) = random_block(&device, 2, 3);
    let (k1, v1) = random_block(&device, 2, 1);
    cache.append(&k0, &v0, None).unwrap();
    cache.append(&k1, &v1, None).unwrap();
    let (keys, values) = cache.materialize().unwrap();
    allclose(&keys, &Tensor::cat(&[&k0, &k1], 2).unwrap(), 0.0);
    allclose(&values, &Tensor::cat(&[&v0, &v1], 2).unwrap(), 0.0);
}

#[test]
fn reindex_follows_selected_parent() {
    let device = Device::Cpu;
    let mut cache = KvCacheEntry::init_empty(layout(1, 3, 8), DType::F32, &device).unwrap();
    let (prefix_k, prefix_v) = random_block(&device, 3, 2);
    cache.append(&prefix_k, &prefix_v, None).unwrap();
    let (old_k, old_v) = cache.materialize().unwrap();

    let selection = [2u32, 0, 2];
    let (step_k, step_v) = random_block(&device, 3, 1);
    cache.append(&step_k, &step_v, Some(&selection)).unwrap();
    let (keys, values) = cache.materialize().unwrap();

    for (row, &parent) in selection.iter().enumerate() {
        let expected_k = Tensor::cat(
            &[
                &old_k.narrow(0, parent as usize, 1).unwrap(),
                &step_k.narrow(0, row, 1).unwrap(),
            ],
            2,
        )
        .unwrap();
        let expected_v = Tensor::cat(
            &[
                &old_v.narrow(0, parent as usize, 1).unwrap(),
                &step_v.narrow(0, row, 1).unwrap(),
            ],
            2,
        )
        .unwrap();
        allclose(&keys.narrow(0, row, 1).unwrap(), &expected_k, 0.0);
        allclose(&values.narrow(0, row, 1).unwrap(), &expected_v, 0.0);
    }
}

#[test]
fn chained_reorders_match_eager_reindexing() {
    let device = Device::Cpu;
    let mut cache = KvCacheEntry::init_empty(layout(2, 2, 8), DType::F32, &device).unwrap();
    let (mut eager_k, mut eager_v) = random_block(&device, 4, 2);
    cache.append(&eager_k, &eager_v, None).unwrap();

    for selection in [[1u32, 1, 2, 3], [0, 1, 3, 3], [1, 0, 2, 2]] {
        let (step_k, step_v) = random_block(&device, 4, 1);
        cache.append(&step_k, &step_v, Some(&selection)).unwrap();
        eager_k = Tensor::cat(&[&select_rows(&eager_k, &selection), &step_k], 2).unwrap();
        eager_v = Tensor::cat(&[&select_rows(&eager_v, &selection), &step_v], 2).unwrap();
    }

    let (keys, values) = cache.materialize().unwrap();
    allclose(&keys, &eager_k, 0.0);
    allclose(&values, &eager_v, 0.0);
    let (window_k, _) = cache.window(3).unwrap();
    allclose(&window_k, &eager_k.narrow(2, 2, 3).unwrap(), 0.0);
}

#[test]
fn selection_must_stay_within_batch_item() {
    let device = Device::Cpu;
    let mut cache = KvCacheEntry::init_empty(layout(2, 2, 8), DType::F32, &device).unwrap();
    let (k, v) = random_block(&device, 4, 1);
    cache.append(&k, &v, None).unwrap();
    let err = cache.append(&k, &v, Some(&[2, 1, 2, 3])).unwrap_err();
    assert!(matches!(err, AttentionError::BeamSelection { row: 0, parent: 2 }));
    let err = cache.append(&k, &v, Some(&[0, 1])).unwrap_err();
    assert!(matches!(err, AttentionError::InvalidShape { .. }));
    assert_eq!(cache.seq_len(), 1);
}

#[test]
fn append_past_capacity_fails() {
    let device = Device::Cpu;
    let mut cache = KvCacheEntry::init_empty(layout(1, 1, 4), DType::F32, &device).unwrap();
    let (k, v) = random_block(&device, 1, 3);
    cache.append(&k, &v, None).unwrap();
    let err = cache.append(&k, &v, None).unwrap_err();
    assert!(matches!(
        err,
        AttentionError::Capacity {
            required: 6,
            capacity: 4
        }
    ));
    assert_eq!(cache.stored_len(), 3);
}

#[test]
fn rejects_mismatched_blocks() {
    let device = Device::Cpu;
    let mut cache = KvCacheEntry::init_empty(layout(1, 1, 4), DType::F32, &device).unwrap();
    let wrong_heads = Tensor::zeros((1, 3, 1, 4), DType::F32, &device).unwrap();
    assert!(cache.append(&wrong_heads, &wrong_heads, None).is_err());
    let wrong_dtype = Tensor::zeros((1, 2, 1, 4), DType::BF16, &device).unwrap();
    assert!(cache.append(&wrong_dtype, &wrong_dtype, None).is_err());
    let (k, _) = random_block(&device, 1, 1);
    let (_, v) = random_block(&device, 1, 2);
    assert!(cache.append(&k, &v, None).is_err());
}

#[test]
fn history_cache_keeps_logical_length() {
    let device = Device::Cpu;
    let (k, v) = random_block(&device, 1, 3);
    let cache = KvCacheEntry::from_history(layout(1, 1, 8), &k, &v, 10).unwrap();
    assert_eq!(cache.stored_len(), 3);
    assert_eq!(cache.seq_len(), 10);
    assert!(KvCacheEntry::from_history(layout(1, 1, 8), &k, &v, 2).is_err());
}

#[test]
fn try_clone_detaches_storage() {
    let device = Device::Cpu;
    let mut cache = KvCacheEntry::init_empty(layout(1, 1, 4), DType::F32, &device).unwrap();
    let (k, v) = random_block(&device, 1, 2);
    cache.append(&k, &v, None).unwrap();
    let snapshot = cache.try_clone().unwrap();
    let (k2, v2) = random_block(&device, 1, 2);
    cache.append(&k2, &v2, None).unwrap();
    assert_eq!(snapshot.stored_len(), 2);
    let (keys, _) = snapshot.materialize().unwrap();
    allclose(&keys, &k, 0.0);
}

#[test]
fn concurrency_traits_documented() {
    assert_impl_all!(KvCacheEntry: Send, Sync);
    assert_not_impl_any!(KvCacheEntry: Clone);
}
