use std::{collections::BTreeSet, sync::Arc};

use east_data::InMemoryDataset;
use east_training::{BatchLoader, LoaderOptions};

fn loader(samples: usize, batch_size: usize, num_workers: usize, seed: Option<u64>) -> BatchLoader {
    BatchLoader::new(
        Arc::new(InMemoryDataset::synthetic(samples, 8).unwrap()),
        LoaderOptions {
            batch_size,
            num_workers,
            shuffle: true,
            seed,
        },
    )
    .unwrap()
}

#[test]
fn seven_samples_in_batches_of_three_give_two_batches() {
    let loader = loader(7, 3, 2, Some(3));
    let batches: Vec<_> = loader.epoch(0).unwrap().map(|b| b.unwrap()).collect();
    assert_eq!(batches.len(), 2);
    assert!(batches.iter().all(|batch| batch.len() == 3));
    assert_eq!(batches[0].images.shape, [3, 3, 8, 8]);
}

#[test]
fn batch_count_is_floor_over_a_grid() {
    for samples in 0..12 {
        for batch_size in 1..6 {
            let loader = loader(samples, batch_size, 0, Some(1));
            let sizes: Vec<usize> = loader
                .epoch(0)
                .unwrap()
                .map(|b| b.unwrap().len())
                .collect();
            assert_eq!(sizes.len(), samples / batch_size);
            assert!(sizes.iter().all(|&size| size == batch_size));
        }
    }
}

#[test]
fn every_epoch_uses_a_fresh_permutation() {
    let loader = loader(7, 3, 0, Some(42));
    let mut dropped = BTreeSet::new();
    let mut orders = BTreeSet::new();
    for epoch in 0..10 {
        let indices: Vec<usize> = loader
            .epoch(epoch)
            .unwrap()
            .flat_map(|b| b.unwrap().indices)
            .collect();
        let seen: BTreeSet<usize> = indices.iter().copied().collect();
        assert_eq!(seen.len(), 6, "no duplicates within an epoch");
        dropped.extend((0..7).filter(|i| !seen.contains(i)));
        orders.insert(indices);
    }
    assert!(dropped.len() > 1);
    assert!(orders.len() > 1);
}

#[test]
fn seeded_permutations_are_reproducible() {
    let a = loader(9, 2, 0, Some(5));
    let b = loader(9, 2, 0, Some(5));
    for epoch in 0..4 {
        assert_eq!(a.epoch_order(epoch), b.epoch_order(epoch));
    }
}

#[test]
fn unshuffled_loader_keeps_dataset_order() {
    let loader = BatchLoader::new(
        Arc::new(InMemoryDataset::synthetic(5, 8).unwrap()),
        LoaderOptions {
            batch_size: 2,
            num_workers: 0,
            shuffle: false,
            seed: None,
        },
    )
    .unwrap();
    let indices: Vec<Vec<usize>> = loader
        .epoch(3)
        .unwrap()
        .map(|b| b.unwrap().indices)
        .collect();
    assert_eq!(indices, vec![vec![0, 1], vec![2, 3]]);
}
