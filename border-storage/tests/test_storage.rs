use anyhow::Result;
use border_storage::{
    index::Index,
    record::{FieldPath, Record, Tensor, Value},
    storage::{
        shared, CompressedListStorage, CompressedListStorageConfig, EnsembleIndex,
        Entity, LazyStackStorage, LazyStackStorageConfig, ListStorage, MemmapStorageConfig,
        StateDict, Storage, StorageEnsemble, TensorStorage, TensorStorageConfig,
    },
    StorageError,
};
use std::sync::Arc;
use tempdir::TempDir;

const OBS_DIM: usize = 4;

fn transitions(n: usize, offset: i64) -> Result<Record> {
    let obs: Vec<f32> = (0..n * OBS_DIM).map(|i| (i as i64 + offset) as f32).collect();
    let act: Vec<i64> = (0..n as i64).map(|i| i + offset).collect();
    let done: Vec<bool> = (0..n).map(|i| i % 2 == 0).collect();
    Ok(Record::from_fields([
        ("obs", Record::Tensor(Tensor::from_vec(obs, &[n, OBS_DIM])?)),
        ("act", Record::Tensor(Tensor::from_vec(act, &[n])?)),
        (
            "next",
            Record::from_fields([("done", Record::Tensor(Tensor::from_vec(done, &[n])?))]),
        ),
    ]))
}

fn items(n: usize, offset: i64) -> Result<Vec<Record>> {
    transitions(n, offset)?.unbind()
}

fn act_of(record: &Record) -> Vec<i64> {
    record
        .get_path(&FieldPath::from("act"))
        .and_then(Record::as_tensor)
        .map(|t| t.to_vec::<i64>().unwrap())
        .unwrap()
}

fn all_storages(dir: &TempDir) -> Result<Vec<Box<dyn Storage>>> {
    Ok(vec![
        Box::new(ListStorage::new(Some(8))),
        Box::new(LazyStackStorage::build(
            &LazyStackStorageConfig::default().max_size(8),
        )),
        Box::new(TensorStorage::lazy(&TensorStorageConfig::default().max_size(8))?),
        Box::new(TensorStorage::memmap(
            &MemmapStorageConfig::default()
                .max_size(8)
                .scratch_dir(dir.path().join("scratch")),
        )?),
        Box::new(CompressedListStorage::build(
            &CompressedListStorageConfig::default().max_size(8),
        )),
    ])
}

#[test_log::test]
fn test_capacity_invariant() -> Result<()> {
    let dir = TempDir::new("capacity_invariant")?;
    for mut storage in all_storages(&dir)? {
        let mut cursor = 0usize;
        for (k, item) in items(20, 0)?.into_iter().enumerate() {
            storage.set(&cursor.into(), item, true)?;
            assert!(storage.len() <= storage.max_size(), "{} after {} writes", storage.name(), k);
            cursor = (cursor + 1) % storage.max_size();
        }
        assert_eq!(storage.len(), storage.max_size(), "{}", storage.name());
    }
    Ok(())
}

#[test_log::test]
fn test_attached_readers() -> Result<()> {
    let dir = TempDir::new("attached_readers")?;
    for mut storage in all_storages(&dir)? {
        let sampler: Entity = Arc::new("sampler");
        let writer: Entity = Arc::new(7usize);
        storage.attach(&sampler);
        storage.attach(&sampler);
        storage.attach(&writer);
        assert_eq!(storage.attached_entities().len(), 2, "{}", storage.name());

        drop(writer);
        let live = storage.attached_entities();
        assert_eq!(live.len(), 1, "{}", storage.name());
        assert!(Arc::ptr_eq(&live[0], &sampler));
    }
    Ok(())
}

#[test_log::test]
fn test_rand_given_ndim() -> Result<()> {
    let dir = TempDir::new("rand_given_ndim")?;
    for mut storage in all_storages(&dir)? {
        assert!(storage.rand_given_ndim(4).is_err(), "{}", storage.name());
        for (i, item) in items(3, 0)?.into_iter().enumerate() {
            storage.set(&i.into(), item, true)?;
        }
        match storage.rand_given_ndim(10)? {
            Index::List(ixs) => {
                assert_eq!(ixs.len(), 10);
                assert!(ixs.iter().all(|i| (0..3).contains(i)), "{}", storage.name());
            }
            other => panic!("{} drew {:?}", storage.name(), other),
        }
    }
    Ok(())
}

#[test_log::test]
fn test_round_trip() -> Result<()> {
    let dir = TempDir::new("round_trip")?;
    for mut storage in all_storages(&dir)? {
        for (i, item) in items(3, 10)?.into_iter().enumerate() {
            storage.set(&i.into(), item.clone(), true)?;
            assert_eq!(storage.get(&i.into())?, item, "{}", storage.name());
        }
    }
    Ok(())
}

#[test_log::test]
fn test_first_write_freezes_template() -> Result<()> {
    let dir = TempDir::new("frozen_template")?;
    let config = MemmapStorageConfig::default()
        .max_size(8)
        .scratch_dir(dir.path().join("scratch"));
    let storages = vec![
        TensorStorage::lazy(&TensorStorageConfig::default().max_size(8))?,
        TensorStorage::memmap(&config)?,
    ];
    for mut storage in storages {
        storage.set(&0.into(), items(1, 0)?.remove(0), true)?;

        let wrong_dtype = Record::from_fields([
            ("obs", Record::Tensor(Tensor::from_vec(vec![0f64; OBS_DIM], &[OBS_DIM])?)),
            ("act", Record::Tensor(Tensor::scalar(0i64))),
            ("next", Record::from_fields([("done", Record::Tensor(Tensor::scalar(true)))])),
        ]);
        let err = storage.set(&1.into(), wrong_dtype, true).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::Type(_))
        ));

        let non_array = Record::from_fields([
            ("obs", Record::Tensor(Tensor::from_vec(vec![0f32; OBS_DIM], &[OBS_DIM])?)),
            ("act", Record::Value(Value::Int(0))),
            ("next", Record::from_fields([("done", Record::Tensor(Tensor::scalar(true)))])),
        ]);
        assert!(storage.set(&1.into(), non_array, true).is_err());
    }
    Ok(())
}

#[test_log::test]
fn test_append_discipline() -> Result<()> {
    let mut storage = ListStorage::new(Some(5));
    let mut items = items(6, 0)?.into_iter();
    for i in 0..3usize {
        storage.set(&i.into(), items.next().unwrap(), true)?;
    }
    let err = storage.set(&4.into(), items.next().unwrap(), true).unwrap_err();
    assert!(matches!(err.downcast_ref::<StorageError>(), Some(StorageError::Range(_))));

    storage.set(&3.into(), items.next().unwrap(), true)?;
    storage.set(&4.into(), items.next().unwrap(), true)?;
    let err = storage.set(&5.into(), items.next().unwrap(), true).unwrap_err();
    assert!(matches!(err.downcast_ref::<StorageError>(), Some(StorageError::Range(_))));
    Ok(())
}

#[test_log::test]
fn test_ensemble_routing() -> Result<()> {
    let a = shared(ListStorage::new(None));
    let b = shared(TensorStorage::lazy(&TensorStorageConfig::default().max_size(10))?);
    a.write().set(&(0..5).into(), Record::List(items(5, 0)?), true)?;
    b.write().set(&(0..5).into(), transitions(5, 100)?, true)?;

    let ensemble = StorageEnsemble::new(vec![a.clone(), b.clone()], None)?;
    let out = ensemble.get(&EnsembleIndex {
        buffer_ids: vec![0, 1],
        index: vec![Index::Int(2), Index::Int(3)],
    })?;
    assert_eq!(out.len(), 2);
    assert_eq!(out[0], (0, a.read().get(&2.into())?));
    assert_eq!(out[1], (1, b.read().get(&3.into())?));
    assert_eq!(act_of(&out[1].1), vec![103]);
    Ok(())
}

#[test_log::test]
fn test_empty_resets_length() -> Result<()> {
    let mut storage = TensorStorage::lazy(&TensorStorageConfig::default().max_size(8))?;
    storage.set(&(0..4).into(), transitions(4, 0)?, true)?;
    storage.empty();
    assert_eq!(storage.len(), 0);
    assert!(storage.is_initialized());

    // The buffers keep their contents.
    match storage.state_dict()? {
        StateDict::Tensor { storage: Some(buffers), len, .. } => {
            assert_eq!(len, 0);
            assert_eq!(act_of(&buffers)[..4], [0, 1, 2, 3]);
        }
        other => panic!("unexpected state dict {:?}", other),
    }

    let mut list = ListStorage::new(Some(8));
    list.set(&(0..4).into(), Record::List(items(4, 0)?), true)?;
    list.empty();
    assert_eq!(list.len(), 0);
    assert!(list.get(&0.into()).is_err());
    Ok(())
}

#[test_log::test]
fn test_compressed_bytes() -> Result<()> {
    let mut storage =
        CompressedListStorage::build(&CompressedListStorageConfig::default().max_size(8));
    assert_eq!(storage.bytes()?, 0);
    storage.set(&(0..3).into(), transitions(3, 0)?, true)?;
    assert!(storage.bytes()? > 0);
    storage.empty();
    assert_eq!(storage.bytes()?, 0);
    Ok(())
}

#[test_log::test]
fn test_ndim2_capacity_rounding() -> Result<()> {
    let mut storage =
        TensorStorage::lazy(&TensorStorageConfig::default().max_size(100).ndim(2))?;
    let rows = Tensor::from_vec(vec![1f32; 2 * 7], &[2, 7])?;
    storage.set(&vec![0usize, 1].into(), Record::Tensor(rows), true)?;
    assert_eq!(storage.max_size(), 105);
    assert_eq!(storage.max_size_along_dim0()?, 15);
    assert_eq!(storage.len(), 14);
    assert_eq!(storage.shape()?, vec![2, 7]);

    let row = storage.get(&Index::Int(1))?;
    assert_eq!(row.as_tensor().unwrap().shape(), &[7]);
    let cell = storage.get(&Index::Tuple(vec![Index::Int(1), Index::Int(6)]))?;
    assert_eq!(cell.as_tensor().unwrap().to_vec::<f32>()?, vec![1.]);
    Ok(())
}

#[test_log::test]
fn test_lazy_stack_view() -> Result<()> {
    let mut storage = LazyStackStorage::build(&LazyStackStorageConfig::default().max_size(8));
    let mut stored = vec![];
    for (i, len) in [2usize, 5, 3].into_iter().enumerate() {
        let item = Record::from_fields([(
            "obs",
            Record::Tensor(Tensor::from_vec(vec![i as f32; len], &[len])?),
        )]);
        storage.set(&i.into(), item.clone(), true)?;
        stored.push(item);
    }

    let out = storage.get(&vec![0usize, 1, 2].into())?;
    let stacked = out.as_stacked().unwrap();
    assert_eq!(stacked.len(), 3);
    let obs = stacked.field("obs")?;
    for (i, item) in stored.iter().enumerate() {
        let source = item.field("obs").and_then(Record::as_tensor).unwrap();
        let view = obs.item(i).and_then(Record::as_tensor).unwrap();
        assert!(view.shares_data(source));
    }
    Ok(())
}

#[test_log::test]
fn test_checkpoint_round_trip() -> Result<()> {
    let dir = TempDir::new("checkpoint_round_trip")?;

    let mut list = ListStorage::new(Some(8));
    list.set(&(0..3).into(), Record::List(items(3, 0)?), true)?;
    list.dumps(&dir.path().join("list"))?;
    let mut restored = ListStorage::new(Some(8));
    restored.loads(&dir.path().join("list"))?;
    assert_eq!(restored.state_dict()?, list.state_dict()?);

    let mut tensor = TensorStorage::lazy(&TensorStorageConfig::default().max_size(8))?;
    tensor.set(&(0..5).into(), transitions(5, 0)?, true)?;
    tensor.dumps(&dir.path().join("tensor"))?;
    assert!(dir.path().join("tensor/storage/next/done.memmap").exists());
    let mut restored = TensorStorage::lazy(&TensorStorageConfig::default().max_size(8))?;
    restored.loads(&dir.path().join("tensor"))?;
    assert_eq!(restored.len(), 5);
    assert_eq!(restored.get(&(0..5).into())?, tensor.get(&(0..5).into())?);

    let mut compressed =
        CompressedListStorage::build(&CompressedListStorageConfig::default().max_size(8));
    compressed.set(&(0..4).into(), transitions(4, 0)?, true)?;
    compressed.dumps(&dir.path().join("compressed"))?;
    let mut restored =
        CompressedListStorage::build(&CompressedListStorageConfig::default().max_size(8));
    restored.loads(&dir.path().join("compressed"))?;
    assert_eq!(restored.get(&2.into())?, compressed.get(&2.into())?);

    let a = shared(ListStorage::new(None));
    a.write().set(&0.into(), items(1, 0)?.remove(0), true)?;
    let mut ensemble = StorageEnsemble::new(vec![a], None)?;
    ensemble.dumps(&dir.path().join("ensemble"))?;
    assert!(dir.path().join("ensemble/0/storage.bin").exists());
    ensemble.loads(&dir.path().join("ensemble"))?;
    Ok(())
}

#[test_log::test]
fn test_memmap_checkpoint_in_place() -> Result<()> {
    let dir = TempDir::new("memmap_checkpoint")?;
    let ckpt = dir.path().join("ckpt");
    let config = MemmapStorageConfig::default()
        .max_size(8)
        .scratch_dir(ckpt.join("storage"));
    let mut storage = TensorStorage::memmap(&config)?;
    storage.set(&(0..6).into(), transitions(6, 0)?, true)?;
    storage.dumps(&ckpt)?;
    let expected = storage.get(&(0..6).into())?;
    drop(storage);

    // The leaf files already live in the checkpoint and are mapped again.
    let mut restored = TensorStorage::memmap(&config)?;
    restored.loads(&ckpt)?;
    assert_eq!(restored.len(), 6);
    assert_eq!(restored.get(&(0..6).into())?, expected);

    // Another storage copies the files into its own scratch directory.
    let mut copy = TensorStorage::memmap(
        &MemmapStorageConfig::default()
            .max_size(8)
            .scratch_dir(dir.path().join("copy")),
    )?;
    copy.loads(&ckpt)?;
    assert_eq!(copy.get(&(0..6).into())?, expected);
    Ok(())
}

#[test_log::test]
fn test_share_memmap_storage() -> Result<()> {
    let dir = TempDir::new("share_memmap")?;
    let mut storage = TensorStorage::memmap(
        &MemmapStorageConfig::default()
            .max_size(8)
            .scratch_dir(dir.path().join("scratch")),
    )?;
    let err = storage.share().unwrap_err();
    assert!(err.to_string().contains("has not been initialized yet"));

    storage.set(&(0..2).into(), transitions(2, 0)?, true)?;
    let worker = std::thread::spawn({
        let mut handle = storage.share()?;
        move || handle.set(&(2..4).into(), transitions(2, 50).unwrap(), true)
    });
    worker.join().unwrap()?;
    assert_eq!(storage.len(), 4);
    assert_eq!(act_of(&storage.get(&(0..4).into())?), vec![0, 1, 50, 51]);

    let compilable = TensorStorage::memmap(
        &MemmapStorageConfig::default()
            .max_size(8)
            .compilable(true)
            .scratch_dir(dir.path().join("compilable")),
    )?;
    assert!(compilable.share().is_err());
    Ok(())
}
