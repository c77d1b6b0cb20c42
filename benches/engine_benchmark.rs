use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tcep_rust::condition::{CmpOp, Condition, Term};
use tcep_rust::engine::Engine;
use tcep_rust::event::{Event, Payload};
use tcep_rust::pattern::{NegationMode, Pattern, PatternOperator, Placeholder, TreeShape};
use tcep_rust::tree::EvalTree;

fn gen_events(count: usize, event_types: &[&str], seed: u64) -> Vec<Event> {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let mut timestamp = 0u64;
    let mut events = Vec::with_capacity(count);
    for id in 0..count {
        timestamp += rng.gen_range(1..4);
        let event_type = event_types[rng.gen_range(0..event_types.len())];
        let mut payload = Payload::default();
        payload.insert("v".to_string(), rng.gen_range(0..100i64).into());
        events.push(Event::new(event_type, timestamp, payload, id as u64));
    }
    events
}

fn count_matches(pattern: &Pattern, mode: NegationMode, events: &[Event]) -> usize {
    let shape = TreeShape::left_deep(pattern.num_positives());
    let tree = EvalTree::new(pattern, &shape, mode).expect("tree construction failed");
    Engine::new(events.iter().cloned(), tree)
        .map(|m| m.expect("evaluation failed"))
        .count()
}

fn sequence_benchmark(c: &mut Criterion) {
    let pattern = Pattern::new(
        PatternOperator::Seq,
        vec![
            Placeholder::new("A", "a"),
            Placeholder::new("B", "b"),
            Placeholder::new("C", "c"),
        ],
        Condition::cmp(CmpOp::Lt, Term::attr("a", "v"), Term::attr("c", "v")),
        50,
    );
    let events = gen_events(2000, &["A", "B", "C"], 42);

    c.bench_function("seq3_sliding_window", |b| {
        b.iter(|| count_matches(black_box(&pattern), NegationMode::FirstChance, &events))
    });
}

fn negation_benchmark(c: &mut Criterion) {
    let pattern = Pattern::new(
        PatternOperator::Seq,
        vec![
            Placeholder::new("A", "a"),
            Placeholder::negated("X", "x"),
            Placeholder::new("B", "b"),
        ],
        Condition::cmp(CmpOp::Gt, Term::attr("x", "v"), Term::attr("a", "v")),
        50,
    );
    let events = gen_events(2000, &["A", "B", "X"], 17);

    c.bench_function("negation_first_chance", |b| {
        b.iter(|| count_matches(black_box(&pattern), NegationMode::FirstChance, &events))
    });
    c.bench_function("negation_post_processing", |b| {
        b.iter(|| count_matches(black_box(&pattern), NegationMode::PostProcessing, &events))
    });
}

criterion_group!(benches, sequence_benchmark, negation_benchmark);
criterion_main!(benches);
