#![forbid(unsafe_code)]

use meridian_patch::{apply_json_patch, diff, Patch};
use serde_json::{Map, Value as Json};

/// Small deterministic generator so failures reproduce from the seed alone.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
    fn below(&mut self, n: u64) -> u64 { self.next() % n }
}

fn gen(rng: &mut Lcg, depth: u32) -> Json {
    let leaf_only = depth == 0;
    match rng.below(if leaf_only { 5 } else { 7 }) {
        0 => Json::Null,
        1 => Json::Bool(rng.below(2) == 1),
        2 => Json::from(rng.below(100) as i64 - 50),
        3 => Json::from(format!("s{}", rng.below(6))),
        4 => Json::from(rng.below(1000) as f64 / 8.0),
        5 => {
            let n = rng.below(5);
            Json::Array((0..n).map(|_| gen(rng, depth - 1)).collect())
        }
        _ => {
            let n = rng.below(5);
            let mut m = Map::new();
            for _ in 0..n {
                // keys deliberately include pointer metacharacters
                let k = match rng.below(4) { 0 => "a/b".to_string(), 1 => "t~x".to_string(), _ => format!("k{}", rng.below(5)) };
                m.insert(k, gen(rng, depth - 1));
            }
            Json::Object(m)
        }
    }
}

/// Mutate a tree so the pair shares structure and the diff stays interesting.
fn perturb(rng: &mut Lcg, v: &Json, depth: u32) -> Json {
    if rng.below(5) == 0 { return gen(rng, depth.min(2)); }
    match v {
        Json::Object(m) => {
            let mut out = Map::new();
            for (k, x) in m {
                if rng.below(6) == 0 { continue; }
                out.insert(k.clone(), perturb(rng, x, depth.saturating_sub(1)));
            }
            if rng.below(3) == 0 { out.insert(format!("n{}", rng.below(3)), gen(rng, 1)); }
            Json::Object(out)
        }
        Json::Array(a) => {
            let mut out: Vec<Json> = Vec::new();
            for x in a {
                if rng.below(5) != 0 { out.push(perturb(rng, x, depth.saturating_sub(1))); }
            }
            for _ in 0..rng.below(3) { out.push(gen(rng, 1)); }
            Json::Array(out)
        }
        other => other.clone(),
    }
}

#[test]
fn applying_diff_yields_target_for_random_trees() {
    let mut rng = Lcg(0x5eed_1234);
    for round in 0..2_000 {
        let a = gen(&mut rng, 4);
        let b = if round % 3 == 0 { gen(&mut rng, 4) } else { perturb(&mut rng, &a, 4) };
        let ops = diff(&a, &b);
        let out = apply_json_patch(&a, &ops).unwrap_or_else(|e| panic!("round {}: {} applying {:?}", round, e, ops));
        assert_eq!(out, b, "round {}: a={} ops={:?}", round, a, ops);
    }
}

#[test]
fn identical_trees_produce_empty_diff() {
    let mut rng = Lcg(42);
    for _ in 0..200 {
        let a = gen(&mut rng, 4);
        assert!(diff(&a, &a.clone()).is_empty());
    }
}

#[test]
fn diff_as_patch_value_round_trips_through_wire_form() {
    let a = serde_json::json!({"spec": {"replicas": 1, "ports": [80]}});
    let b = serde_json::json!({"spec": {"replicas": 3, "ports": [80, 443]}, "status": {"ok": true}});
    let wire = serde_json::to_value(diff(&a, &b)).unwrap();
    let p = Patch::from_document(meridian_patch::PatchType::JsonPatch, wire).unwrap();
    assert_eq!(p.apply(&a).unwrap(), b);
}
