// tests/test_nms.rs — Properties of non-maximum suppression over random
// box clouds.

use acfdet::nms::{nms, NmsOptions};
use acfdet::BoundingBox;

fn cloud(seed: u64, n: usize) -> Vec<BoundingBox> {
    let mut state = seed;
    let mut next = move || {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (state >> 40) as f32 / (1u64 << 24) as f32
    };
    (0..n)
        .map(|_| {
            let size = 10.0 + next() * 30.0;
            BoundingBox::new(next() * 100.0, next() * 100.0, size, size * 2.0, (next() * 100.0).round())
        })
        .collect()
}

#[test]
fn survivors_clear_threshold_and_do_not_overlap() {
    for seed in 0..25 {
        let mut boxes = cloud(seed, 60);
        nms(&mut boxes, 30.0, 0.65, true);
        assert!(boxes.iter().all(|b| b.score > 30.0));
        for (i, a) in boxes.iter().enumerate() {
            for b in &boxes[i + 1..] {
                if a.score != b.score {
                    assert!(a.overlap_min(b) <= 0.65, "seed {seed}: {a:?} overlaps {b:?}");
                }
            }
        }
    }
}

#[test]
fn second_pass_removes_nothing() {
    for seed in 0..25 {
        for greedy in [true, false] {
            let mut boxes = cloud(seed, 40);
            nms(&mut boxes, 10.0, 0.5, greedy);
            let before = boxes.len();
            nms(&mut boxes, 10.0, 0.5, greedy);
            assert_eq!(boxes.len(), before, "seed {seed} greedy {greedy}");
        }
    }
}

#[test]
fn non_greedy_never_keeps_more_than_greedy() {
    for seed in 0..25 {
        let mut greedy = cloud(seed, 50);
        let mut chain = greedy.clone();
        nms(&mut greedy, 0.0, 0.4, true);
        nms(&mut chain, 0.0, 0.4, false);
        assert!(chain.len() <= greedy.len());
    }
}

#[test]
fn best_box_always_survives() {
    for seed in 0..25 {
        let mut boxes = cloud(seed, 50);
        let best = boxes.iter().map(|b| b.score).fold(f32::MIN, f32::max);
        NmsOptions::default().apply(&mut boxes, -1.0);
        assert!(boxes.iter().any(|b| b.score == best));
    }
}

#[test]
fn options_deserialize_with_defaults() {
    let opts: NmsOptions = serde_json::from_str(r#"{ "min_score": 30.0 }"#).unwrap();
    assert_eq!(opts, NmsOptions { min_score: Some(30.0), ..NmsOptions::default() });
}
