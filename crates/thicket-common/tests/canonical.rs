//! Determinism and integrity checks over generated values

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use thicket_common::{Map, Value, compute_cid, decode, encode, verify_cid};

fn random_value(rng: &mut StdRng, depth: usize) -> Value {
    let pick = if depth == 0 { rng.gen_range(0..6) } else { rng.gen_range(0..8) };
    match pick {
        0 => Value::Null,
        1 => Value::Bool(rng.r#gen()),
        2 => Value::int(rng.gen_range(-100_000..100_000)),
        3 => Value::Unsigned(rng.r#gen()),
        4 => Value::text(format!("text-{}", rng.gen_range(0..1000))),
        5 => Value::bytes((0..rng.gen_range(0..16)).map(|_| rng.r#gen::<u8>()).collect::<Vec<_>>()),
        6 => Value::Array((0..rng.gen_range(0..4)).map(|_| random_value(rng, depth - 1)).collect()),
        _ => {
            let mut map = Map::new();
            for _ in 0..rng.gen_range(0..5) {
                let key = format!("{}{}", "k".repeat(rng.gen_range(1..4)), rng.gen_range(0..50));
                map.insert(key.into(), random_value(rng, depth - 1));
            }
            Value::Map(map)
        }
    }
}

#[test]
fn generated_values_round_trip() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..200 {
        let value = random_value(&mut rng, 3);
        let bytes = encode(&value);
        assert_eq!(decode(&bytes).unwrap(), value);
        assert_eq!(encode(&value), bytes);
    }
}

#[test]
fn map_insertion_order_does_not_matter() {
    let mut rng = StdRng::seed_from_u64(11);
    let mut pairs: Vec<(String, Value)> = (0..24)
        .map(|i| (format!("{}{}", "x".repeat(i % 5 + 1), i), Value::Unsigned(i as u64)))
        .collect();

    let reference = encode(&Value::Map(pairs.iter().cloned().map(|(k, v)| (k.into(), v)).collect()));
    for _ in 0..20 {
        pairs.shuffle(&mut rng);
        let mut map = Map::new();
        for (k, v) in &pairs {
            map.insert(k.as_str().into(), v.clone());
        }
        assert_eq!(encode(&Value::Map(map)), reference);
    }
}

#[test]
fn any_bit_flip_breaks_the_cid() {
    let value = Value::map([
        ("$type", Value::text("app.bsky.feed.post")),
        ("text", Value::text("hello")),
        ("createdAt", Value::text("2024-01-01T00:00:00Z")),
    ]);
    let bytes = encode(&value);
    let cid = compute_cid(&bytes).unwrap();
    assert!(verify_cid(&cid, &bytes));

    for i in 0..bytes.len() * 8 {
        let mut flipped = bytes.clone();
        flipped[i / 8] ^= 1 << (i % 8);
        assert!(!verify_cid(&cid, &flipped), "flip at bit {} went unnoticed", i);
    }
}
