// Wire codec performance benchmarks. Tests the bincode encode/decode paths
// that sit on every Raft RPC and CDC dedup lookup, the way the teacher's
// network_io_bench.rs times request/response (de)serialization.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use redb_mesh::cdc::{ChangeEvent, ChangeType};
use redb_mesh::consensus::{AppendEntriesRequest, LogEntry, VoteRequest};

fn sample_vote_request() -> VoteRequest {
    VoteRequest { group: "mcg".into(), term: 42, candidate: "node_abc123".into(), last_log_index: 1000, last_log_term: 41, pre_vote: false }
}

fn sample_append_entries(num_entries: usize) -> AppendEntriesRequest {
    AppendEntriesRequest {
        group: "mcg".into(),
        term: 42,
        leader: "node_abc123".into(),
        prev_log_index: 1000,
        prev_log_term: 41,
        entries: (0..num_entries)
            .map(|i| LogEntry { index: 1000 + i as u64, term: 42, op_id: format!("op-{i}"), payload: vec![0u8; 128] })
            .collect(),
        leader_commit: 999,
    }
}

fn bench_vote_request_roundtrip(c: &mut Criterion) {
    let req = sample_vote_request();
    c.bench_function("vote_request_encode", |b| {
        b.iter(|| black_box(bincode::encode_to_vec(&req, bincode::config::standard()).unwrap()));
    });

    let encoded = bincode::encode_to_vec(&req, bincode::config::standard()).unwrap();
    c.bench_function("vote_request_decode", |b| {
        b.iter(|| {
            let (decoded, _): (VoteRequest, usize) = bincode::decode_from_slice(black_box(&encoded), bincode::config::standard()).unwrap();
            black_box(decoded)
        });
    });
}

fn bench_append_entries_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_entries_encode");

    for batch_size in [1, 16, 128] {
        let req = sample_append_entries(batch_size);
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), &req, |b, req| {
            b.iter(|| black_box(bincode::encode_to_vec(req, bincode::config::standard()).unwrap()));
        });
    }

    group.finish();
}

fn bench_cdc_message_id(c: &mut Criterion) {
    let event = ChangeEvent {
        lsn: "000000012345".into(),
        table: "accounts".into(),
        op: ChangeType::Update,
        primary_key: vec![("id".into(), serde_json::json!(12345))],
        before: None,
        after: None,
        commit_ts: 1_700_000_000,
    };

    c.bench_function("cdc_change_event_message_id", |b| {
        b.iter(|| black_box(event.message_id()));
    });
}

criterion_group!(benches, bench_vote_request_roundtrip, bench_append_entries_roundtrip, bench_cdc_message_id);
criterion_main!(benches);
