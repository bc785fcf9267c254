use chain_dict::{Dict, Resolution};
use rayon::prelude::*;
use std::thread;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn evens_with_overrides() -> Dict<u32, String> {
    (0..1_000u32)
        .filter(|k| k % 10 == 0)
        .fold(
            Dict::empty().with_predicate(|k: &u32| k % 2 == 0, "even".to_string()),
            |dict, k| dict.insert(k, format!("tens-{k}")),
        )
        .remove(500)
}

fn expected(k: u32) -> Option<String> {
    if k == 500 {
        None
    } else if k % 10 == 0 && k < 1_000 {
        Some(format!("tens-{k}"))
    } else if k % 2 == 0 {
        Some("even".to_string())
    } else {
        None
    }
}

#[test]
fn parallel_readers_agree() {
    init_tracing();
    let dict = evens_with_overrides();

    let mismatches = (0..2_000u32)
        .into_par_iter()
        .filter(|k| dict.get(k) != expected(*k))
        .count();
    assert_eq!(mismatches, 0);
}

#[test]
fn writers_on_other_threads_do_not_disturb_readers() {
    init_tracing();
    let base = evens_with_overrides();

    let branches: Vec<Dict<u32, String>> = thread::scope(|s| {
        let handles: Vec<_> = (0..4u32)
            .map(|n| {
                let base = base.clone();
                s.spawn(move || base.insert(n, format!("branch-{n}")).remove(2))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for (n, branch) in branches.iter().enumerate() {
        let n = n as u32;
        if n == 2 {
            assert_eq!(branch.get(&n), None);
        } else {
            assert_eq!(branch.get(&n), Some(format!("branch-{n}")));
        }
        assert_eq!(branch.depth(), base.depth() + 2);
    }

    // the shared base answers exactly as before
    assert_eq!(base.get(&0), Some("tens-0".to_string()));
    assert_eq!(base.get(&2), Some("even".to_string()));
    assert_eq!(base.get(&3), None);
}

#[test]
fn mapped_views_are_shareable() {
    init_tracing();
    let lengths = evens_with_overrides().map(|s| s.len());

    let total: usize = (0..100u32)
        .into_par_iter()
        .filter_map(|k| lengths.get(&k))
        .sum();
    // 10 "tens-N" entries in 0..100 plus 40 other evens of length 4
    let tens: usize = (0..100u32).step_by(10).map(|k| format!("tens-{k}").len()).sum();
    assert_eq!(total, tens + 40 * 4);

    assert_eq!(lengths.resolve(&500), Resolution::Removed { depth: 0 });
}
