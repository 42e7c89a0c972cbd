//! A full episode: one trace, then requests until a new seed exists.

use std::{fs, io::Cursor, time::Duration};

use libafl_hybrid::{
    channel::ReaderRequestSource,
    protocol::SolveRequest,
    solver::z3_config,
    union_table::{Operation, Predicate},
    FilterMode, HybridConfig, HybridEngine, LabelInfo,
};
use z3::Context;

#[test]
fn test_episode_writes_seed() {
    let dir = tempfile::tempdir().unwrap();
    let config = HybridConfig::builder()
        .output_dir(dir.path())
        .tree_dir(dir.path().join("trees"))
        .log_dir(dir.path())
        .filter_mode(FilterMode::Coverage)
        .solver_timeout(Duration::from_secs(5))
        .build();
    let ctx = Context::new(&z3_config(config.solver_timeout));
    let mut engine = HybridEngine::new(&ctx, config, vec![]);

    // in2 ^ 0x20 == 'z'
    let table = engine.table_mut();
    table.set(1, LabelInfo::input(2)).unwrap();
    table
        .set(2, LabelInfo::new(Operation::Xor, 8, 1, 0, 0, 0x20))
        .unwrap();
    table
        .set(3, LabelInfo::icmp(Predicate::Eq, 8, 2, 0, 0, u64::from(b'z')))
        .unwrap();

    let summary = engine
        .run_trace(Cursor::new("1,3,0,4660,9,0,0,12,3\n"))
        .unwrap();
    assert_eq!(summary.tid, 12);
    assert_eq!(summary.decisions, 1);

    let decisions = String::from_utf8(engine.decisions().clone()).unwrap();
    let mut lines = decisions.lines();
    let record = lines.next().unwrap();
    assert!(record.starts_with("4660-"));
    assert!(record.contains("-0-3-12-1@1-1-0-"));
    assert_eq!(lines.next(), Some("END@@"));
    assert!(dir.path().join("trees/tree1/id:000012").exists());

    let queue = dir.path().join("fifo/queue");
    fs::create_dir_all(&queue).unwrap();
    fs::write(queue.join("id:000012"), b"....").unwrap();

    let request = SolveRequest {
        qid: 1,
        tree_id: 12,
        label: 3,
        direction: 0,
        cur_label_loc: 0,
        prefix_hash: 0,
        extra: Default::default(),
    };
    let mut requests = ReaderRequestSource::new(Cursor::new(format!("{request}\n")));
    engine.serve_requests(&mut requests).unwrap();

    let decisions = String::from_utf8(engine.decisions().clone()).unwrap();
    assert_eq!(decisions.lines().last(), Some("ENDNEW@@"));
    assert_eq!(fs::read(queue.join("id:000000")).unwrap(), b"..Z.");
    assert_eq!(engine.stats().nested, 1);
    assert_eq!(engine.stats().requests, 1);
}
