use std::fs;

use stack_pcb_reid::data::{RandomIdentitySampler, ReidDataset};
use stack_pcb_reid::ReidError;

#[test]
fn list_file_resolves_paths_against_root() {
    let dir = tempfile::tempdir().unwrap();
    let list = dir.path().join("train_list.txt");
    fs::write(
        &list,
        "# path pid camid\nimages/a.jpg 12 3\n\nimages/b.jpg 40\nimages/c.jpg 12 1\n",
    )
    .unwrap();

    let dataset = ReidDataset::from_list(dir.path(), &list).unwrap();
    assert_eq!(dataset.len(), 3);
    assert_eq!(dataset.sample(0).path, dir.path().join("images/a.jpg"));
    assert_eq!(dataset.sample(0).camid, 3);
    assert_eq!(dataset.sample(1).camid, 0);
    assert_eq!(dataset.num_pids(), 2);
}

#[test]
fn malformed_list_line_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let list = dir.path().join("bad.txt");
    fs::write(&list, "images/a.jpg 1\nimages/b.jpg person_2\n").unwrap();

    let err = ReidDataset::from_list(dir.path(), &list).unwrap_err();
    match err {
        ReidError::Dataset { msg, .. } => assert!(msg.contains("line 2"), "{msg}"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn market_directory_skips_junk_and_other_files() {
    let dir = tempfile::tempdir().unwrap();
    for name in [
        "0002_c1s1_000451_03.jpg",
        "0002_c2s1_000301_01.jpg",
        "0007_c3s3_076476_02.jpg",
        "-1_c1s1_000401_03.jpg",
    ] {
        fs::write(dir.path().join(name), b"").unwrap();
    }
    fs::write(dir.path().join("Thumbs.db"), b"").unwrap();

    let dataset = ReidDataset::from_market1501(dir.path()).unwrap();
    assert_eq!(dataset.len(), 3);
    assert_eq!(dataset.num_pids(), 2);
    assert_eq!(dataset.num_cams(), 3);

    let relabeled = dataset.relabel();
    let pids: Vec<usize> = relabeled.samples().iter().map(|s| s.pid).collect();
    assert_eq!(pids, vec![0, 0, 1]);
}

#[test]
fn empty_split_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        ReidDataset::from_market1501(dir.path()),
        Err(ReidError::Dataset { .. })
    ));
    assert!(ReidDataset::from_market1501(dir.path().join("nope")).is_err());
}

#[test]
fn sampler_covers_every_identity_once_per_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let list = dir.path().join("list.txt");
    let lines: String = (0..10).map(|i| format!("{i}.jpg {} 0\n", i % 5)).collect();
    fs::write(&list, lines).unwrap();

    let dataset = ReidDataset::from_list(dir.path(), &list).unwrap();
    let sampler = RandomIdentitySampler::new(&dataset, 4);
    let mut rng = <rand::rngs::StdRng as rand::SeedableRng>::seed_from_u64(5);

    let order = sampler.epoch_indices(&mut rng);
    assert_eq!(order.len(), 5 * 4);
    assert!(sampler.check_batch(20).is_ok());
    assert!(sampler.check_batch(24).is_err());
}
