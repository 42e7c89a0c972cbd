//! The protocol engine: one trace in, decisions out, then solve requests until a new seed exists.
//!
//! An episode has two halves. [`HybridEngine::run_trace`] consumes the branch events of one
//! execution, writes a [`DecisionRecord`] per branch to the decision pipe, snapshots the union table
//! and ends with [`ControlToken::End`]. [`HybridEngine::serve_requests`] then answers
//! [`SolveRequest`]s of the scheduler until one of them produced a new seed.

use std::{
    fs::File,
    io::{BufRead, Write},
    time::Instant,
};

use hashbrown::{HashMap, HashSet};
use z3::Context;

use crate::{
    channel::{open_decision_pipe, RequestSource},
    config::{FilterMode, HybridConfig},
    deps::BranchDeps,
    filters::{call_context_hash, BranchFilter, BranchVerdict, TraceFilterState},
    protocol::{
        parse_memcmp_payload, BranchEvent, ControlToken, DecisionPayload, DecisionRecord,
        EventKind, SolveRequest, UNKNOWN_TID,
    },
    serializer::Serializer,
    solution::{source_testcase, SeedWriter, Solution, SolutionQueue},
    solver::{FlipTarget, NestedSolver, SolveOutcome},
    stats::{HybridStats, STATS_FILE},
    tree::TreeStore,
    union_table::{Label, UnionTable, MAX_EXPR_DEPTH},
    Error,
};

/// Branches with larger expressions are not reported for solving
pub const MAX_TREE_SIZE: u32 = 50_000;

/// State that lives as long as the process
#[derive(Debug)]
pub struct ProcessState {
    /// Coverage maps, explored prefixes and memcmp sites
    pub filter: BranchFilter,
    /// Counters
    pub stats: HybridStats,
    /// Numbering of new seeds
    pub seeds: SeedWriter,
    /// Memory compare solutions not written as seeds
    pub solutions: SolutionQueue,
}

impl ProcessState {
    /// Fresh state for `config`
    #[must_use]
    pub fn new(config: &HybridConfig) -> Self {
        Self {
            filter: BranchFilter::new(config.filter_mode, config.prefix_map_bytes),
            stats: HybridStats::new(),
            seeds: SeedWriter::new(config.seed_dir()),
            solutions: SolutionQueue::new(),
        }
    }
}

/// State of the trace being processed
#[derive(Debug)]
pub struct SessionState {
    filters: TraceFilterState,
    flipped: HashSet<Label>,
    first_qid: Option<u32>,
    first_tid: Option<u32>,
    reported_max_label: Label,
    touched_max_label: Label,
    skip_rest: bool,
    started: Instant,
}

impl SessionState {
    fn new(node_buckets: u32) -> Self {
        Self {
            filters: TraceFilterState::new(node_buckets),
            flipped: HashSet::new(),
            first_qid: None,
            first_tid: None,
            reported_max_label: 0,
            touched_max_label: 0,
            skip_rest: false,
            started: Instant::now(),
        }
    }

    fn observe(&mut self, event: &BranchEvent) {
        self.first_qid.get_or_insert(event.qid);
        if event.tid != UNKNOWN_TID {
            self.first_tid.get_or_insert(event.tid);
        }
        self.reported_max_label = self.reported_max_label.max(event.max_label);
        if event.kind() == Some(EventKind::Conditional) {
            self.touched_max_label = self.touched_max_label.max(event.label);
        }
    }

    /// Largest label of the trace, as reported by the instrumentation or as seen in events
    #[must_use]
    pub fn max_label(&self) -> Label {
        if self.reported_max_label > 0 {
            self.reported_max_label
        } else {
            self.touched_max_label
        }
    }
}

/// What happened during a trace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceSummary {
    /// Queue of the traced input
    pub qid: u32,
    /// Id of the traced input
    pub tid: u32,
    /// Events read
    pub events: u64,
    /// Decision records written
    pub decisions: u64,
    /// Events left unprocessed after the time budget ran out
    pub skipped: u64,
}

/// The hybrid engine, writing decisions to `W`.
pub struct HybridEngine<'ctx, W> {
    config: HybridConfig,
    ctx: &'ctx Context,
    table: UnionTable,
    deps: BranchDeps,
    trees: TreeStore,
    solver: NestedSolver<'ctx>,
    process: ProcessState,
    decisions: W,
}

impl<W> std::fmt::Debug for HybridEngine<'_, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridEngine")
            .field("config", &self.config)
            .field("table_len", &self.table.len())
            .field("stats", &self.process.stats)
            .finish_non_exhaustive()
    }
}

impl<'ctx> HybridEngine<'ctx, File> {
    /// An engine writing to the configured decision pipe. Blocks until the scheduler listens.
    pub fn open(ctx: &'ctx Context, config: HybridConfig) -> Result<Self, Error> {
        let decisions = open_decision_pipe(&config.decision_pipe)?;
        Ok(Self::new(ctx, config, decisions))
    }
}

impl<'ctx, W> HybridEngine<'ctx, W>
where
    W: Write,
{
    /// An engine in `ctx`, writing decisions to `decisions`
    #[must_use]
    pub fn new(ctx: &'ctx Context, config: HybridConfig, decisions: W) -> Self {
        log::info!(
            "Hybrid engine in {:?} mode, seeds go to {}",
            config.filter_mode,
            config.seed_dir().display()
        );
        Self {
            trees: TreeStore::new(config.tree_dir.clone()),
            process: ProcessState::new(&config),
            table: UnionTable::new(),
            deps: BranchDeps::new(),
            solver: NestedSolver::new(ctx),
            ctx,
            config,
            decisions,
        }
    }

    /// The configuration
    #[must_use]
    pub fn config(&self) -> &HybridConfig {
        &self.config
    }

    /// The union table of the current trace
    #[must_use]
    pub fn table(&self) -> &UnionTable {
        &self.table
    }

    /// The union table of the current trace, for the instrumentation to fill in
    pub fn table_mut(&mut self) -> &mut UnionTable {
        &mut self.table
    }

    /// The process wide state
    #[must_use]
    pub fn process(&self) -> &ProcessState {
        &self.process
    }

    /// The counters
    #[must_use]
    pub fn stats(&self) -> &HybridStats {
        &self.process.stats
    }

    /// A handle to the queue of memory compare solutions
    #[must_use]
    pub fn solutions(&self) -> SolutionQueue {
        self.process.solutions.clone()
    }

    /// Where the decisions go
    #[must_use]
    pub fn decisions(&self) -> &W {
        &self.decisions
    }

    fn send(&mut self, token: ControlToken) -> Result<(), Error> {
        writeln!(self.decisions, "{token}")?;
        self.decisions.flush()?;
        Ok(())
    }

    /// Process the events of one trace, then run the request loop.
    pub fn run_episode<R, S>(&mut self, events: R, requests: &mut S) -> Result<TraceSummary, Error>
    where
        R: BufRead,
        S: RequestSource,
    {
        let summary = self.run_trace(events)?;
        self.serve_requests(requests)?;
        Ok(summary)
    }

    /// Process the events of one trace until EOF, ending with [`ControlToken::End`].
    ///
    /// Malformed events are skipped, only failures of the decision pipe are returned.
    pub fn run_trace<R>(&mut self, mut events: R) -> Result<TraceSummary, Error>
    where
        R: BufRead,
    {
        let node_buckets = u32::try_from(self.config.prefix_map_bytes).unwrap_or(u32::MAX);
        let mut session = SessionState::new(node_buckets);
        self.process.filter.reset_trace();

        let mut summary = TraceSummary::default();
        let mut line = String::new();
        loop {
            line.clear();
            if events.read_line(&mut line)? == 0 {
                break;
            }
            if line.trim().is_empty() {
                continue;
            }
            let event: BranchEvent = match line.parse() {
                Ok(event) => event,
                Err(err) => {
                    log::warn!("Skipping event {:?}: {err}", line.trim_end());
                    continue;
                }
            };
            summary.events += 1;

            let kind = event.kind();
            if session.skip_rest {
                summary.skipped += 1;
                if kind == Some(EventKind::Memcmp) {
                    line.clear();
                    events.read_line(&mut line)?;
                }
                continue;
            }
            session.observe(&event);

            match kind {
                Some(EventKind::Conditional) => {
                    if self.on_branch(&mut session, &event)? {
                        summary.decisions += 1;
                    }
                }
                Some(EventKind::Memcmp) => {
                    line.clear();
                    if events.read_line(&mut line)? == 0 {
                        log::warn!("Trace ended inside a memcmp event");
                        break;
                    }
                    self.on_memcmp(&event, &line);
                }
                Some(EventKind::Gep) | None => {
                    log::debug!("Ignoring event of type {}", event.cons_type);
                }
            }

            if session.started.elapsed() > self.config.trace_budget {
                log::warn!(
                    "Trace budget of {:?} exhausted, skipping the remaining events",
                    self.config.trace_budget
                );
                session.skip_rest = true;
            }
        }

        summary.qid = session.first_qid.unwrap_or(0);
        summary.tid = session.first_tid.unwrap_or(0);
        self.finish_trace(&session, &summary)?;
        Ok(summary)
    }

    fn on_branch(&mut self, session: &mut SessionState, event: &BranchEvent) -> Result<bool, Error> {
        if event.tid != UNKNOWN_TID {
            session.filters.seed(event.tid);
        }
        let verdict = self.process.filter.evaluate(
            &mut session.filters,
            event.label,
            event.addr,
            event.direction != 0,
            event.ctx,
        );
        self.process.stats.branches += 1;
        if verdict.try_solve {
            self.process.stats.interesting += 1;
        }

        let Some(record) = self.update_graph(session, event, &verdict) else {
            return Ok(false);
        };
        log::trace!("Decision {record}");
        writeln!(self.decisions, "{record}")?;
        self.decisions.flush()?;
        Ok(true)
    }

    /// The record to report for a branch, if any.
    fn update_graph(
        &mut self,
        session: &mut SessionState,
        event: &BranchEvent,
        verdict: &BranchVerdict,
    ) -> Option<DecisionRecord> {
        let mut record = DecisionRecord {
            addr: event.addr,
            ctx_hash: call_context_hash(event.ctx),
            direction: event.direction,
            label: event.label,
            tid: event.tid,
            qid: event.qid,
            payload: DecisionPayload::None,
        };
        if event.label == 0 {
            return Some(record);
        }
        if !session.flipped.insert(event.label) {
            log::trace!("Label {} already handled in this trace", event.label);
            return None;
        }
        if !verdict.try_solve && !verdict.promote {
            return Some(record);
        }

        let info = match self.table.resolve(event.label) {
            Ok(info) => *info,
            Err(err) => {
                log::warn!("Dropping branch at {:#x}: {err}", event.addr);
                return None;
            }
        };
        if info.tree_size > MAX_TREE_SIZE || info.depth > MAX_EXPR_DEPTH {
            log::debug!(
                "Label {} too large (size {}, depth {})",
                event.label,
                info.tree_size,
                info.depth
            );
            return None;
        }

        let start = Instant::now();
        let extra =
            self.deps
                .extra_constraints(&self.table, event.label, event.direction, verdict.memorize);
        self.process.stats.extra_time += start.elapsed();

        record.payload = DecisionPayload::Solve {
            promote: verdict.promote,
            qid: event.qid,
            prefix_hash: verdict.prefix_hash,
            depth: info.depth,
            extra,
        };
        Some(record)
    }

    fn on_memcmp(&mut self, event: &BranchEvent, payload: &str) {
        let bytes = match parse_memcmp_payload(payload, event.label) {
            Ok(bytes) => bytes,
            Err(err) => {
                log::warn!("Skipping memcmp at {:#x}: {err}", event.addr);
                return;
            }
        };
        if !self.process.filter.is_novel_memcmp(
            event.addr,
            event.ctx,
            u64::from(event.direction),
            event.order,
        ) {
            return;
        }

        let offset = event.direction;
        let bytes: HashMap<u32, u8> = (0..)
            .zip(bytes)
            .filter_map(|(i, byte)| offset.checked_add(i).map(|at| (at, byte)))
            .collect();
        let solution = Solution {
            bytes,
            tid: event.tid,
            addr: event.addr,
            ctx: event.ctx,
            order: event.order,
        };
        self.process.stats.memcmp_solutions += 1;

        if self.config.save_whole {
            let source = self.config.current_input();
            self.write_seed(Some(source.as_path()), &solution);
        } else {
            self.process.solutions.push(solution);
        }
    }

    fn write_seed(&mut self, source: Option<&std::path::Path>, solution: &Solution) -> bool {
        match self.process.seeds.write(source, solution) {
            Ok(_) => {
                if self.process.stats.seed_written() {
                    self.report();
                }
                true
            }
            Err(err) => {
                log::warn!("Could not write seed: {err}");
                false
            }
        }
    }

    fn report(&self) {
        let stats = &self.process.stats;
        stats.report();
        if let Err(err) = stats.append_to(&self.config.log_dir.join(STATS_FILE)) {
            log::debug!("Could not append stats: {err}");
        }
    }

    fn finish_trace(&mut self, session: &SessionState, summary: &TraceSummary) -> Result<(), Error> {
        let max_label = session.max_label();
        if let Err(err) = self
            .trees
            .save(summary.qid, summary.tid, &self.table, max_label)
        {
            log::warn!("Could not save the trace tree of {}: {err}", summary.tid);
        }
        self.cleanup();

        let stats = &mut self.process.stats;
        stats.traces += 1;
        stats.pruned = self.deps.pruned();
        stats.trace_time += session.started.elapsed();
        log::debug!(
            "Trace {} done: {} events, {} decisions, {} skipped",
            summary.tid,
            summary.events,
            summary.decisions,
            summary.skipped
        );

        self.send(ControlToken::End)
    }

    fn cleanup(&mut self) {
        self.table.clear(Label::MAX);
        self.deps.clear();
    }

    /// Answer solve requests until one produced a new seed.
    ///
    /// Requests that cannot be parsed are answered with [`ControlToken::EndUnsat`].
    /// Fails if the decision pipe fails, or if `requests` is gone for good.
    pub fn serve_requests<S>(&mut self, requests: &mut S) -> Result<(), Error>
    where
        S: RequestSource,
    {
        loop {
            let line = requests.next_request()?;
            let token = match line.parse::<SolveRequest>() {
                Ok(request) => self.handle_request(&request),
                Err(err) => {
                    log::warn!("Malformed request {line:?}: {err}");
                    ControlToken::EndUnsat
                }
            };
            self.send(token)?;
            if token == ControlToken::EndNew {
                return Ok(());
            }
        }
    }

    /// Answer a single solve request.
    pub fn handle_request(&mut self, request: &SolveRequest) -> ControlToken {
        let start = Instant::now();
        self.process.stats.requests += 1;
        let token = self.solve_request(request);
        match token {
            ControlToken::EndNew => {}
            ControlToken::EndDup => self.process.stats.dup += 1,
            ControlToken::End | ControlToken::EndUnsat => self.process.stats.unsat += 1,
        }
        self.cleanup();
        self.process.stats.solving_time += start.elapsed();
        token
    }

    fn solve_request(&mut self, request: &SolveRequest) -> ControlToken {
        if self.config.filter_mode == FilterMode::PathPrefix
            && !self.process.filter.explored().check(request.prefix_hash)
        {
            log::debug!("Prefix {:#x} already explored", request.prefix_hash);
            return ControlToken::EndDup;
        }

        let reload = Instant::now();
        if let Err(err) = self
            .trees
            .load(request.qid, request.tree_id, &mut self.table)
        {
            log::debug!("Not solving label {}: {err}", request.label);
            return ControlToken::EndDup;
        }
        self.process.stats.reload_time += reload.elapsed();

        let target = FlipTarget {
            label: request.label,
            direction: request.direction,
            tid: request.tree_id,
            prefix_hash: request.prefix_hash,
        };
        let mut serializer = Serializer::new(self.ctx);
        let outcome = self.solver.solve(
            &mut serializer,
            &mut self.table,
            &target,
            &request.extra,
            self.process.filter.explored_mut(),
        );

        let solution = match outcome {
            Ok(SolveOutcome::Nested(solution)) => {
                self.process.stats.nested += 1;
                solution
            }
            Ok(SolveOutcome::Optimistic(solution)) => {
                self.process.stats.optimistic += 1;
                solution
            }
            Ok(SolveOutcome::Unsat) | Err(_) => return ControlToken::EndUnsat,
        };

        let source = source_testcase(&self.config.output_dir, request.qid, request.tree_id);
        if self.write_seed(source.as_deref(), &solution) {
            ControlToken::EndNew
        } else {
            ControlToken::EndUnsat
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, io::Cursor, path::Path, time::Duration};

    use z3::Context;

    use crate::{
        channel::ReaderRequestSource,
        config::{FilterMode, HybridConfig},
        deps::ExtraConstraints,
        protocol::{ControlToken, SolveRequest},
        session::HybridEngine,
        solver::z3_config,
        union_table::{LabelInfo, Operation, Predicate, UnionTable, LABEL_INFO_SIZE},
        Error,
    };

    fn config(dir: &Path, mode: FilterMode) -> HybridConfig {
        HybridConfig::builder()
            .output_dir(dir)
            .tree_dir(dir.join("trees"))
            .log_dir(dir)
            .filter_mode(mode)
            .prefix_map_bytes(1 << 16)
            .build()
    }

    /// 1, 2: in0, in1; 3: in0 == 'A'; 4: in0 + in1; 5: (in0 + in1) == 0x80
    fn fill(table: &mut UnionTable) {
        table.set(1, LabelInfo::input(0)).unwrap();
        table.set(2, LabelInfo::input(1)).unwrap();
        table
            .set(3, LabelInfo::icmp(Predicate::Eq, 8, 1, 0, 0, 0x41))
            .unwrap();
        table
            .set(4, LabelInfo::new(Operation::Add, 8, 1, 2, 0, 0))
            .unwrap();
        table
            .set(5, LabelInfo::icmp(Predicate::Eq, 8, 4, 0, 0, 0x80))
            .unwrap();
    }

    fn output(engine: &HybridEngine<'_, Vec<u8>>) -> Vec<String> {
        String::from_utf8(engine.decisions().clone())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_concrete_branch_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new(&z3_config(Duration::from_secs(5)));
        let mut engine = HybridEngine::new(&ctx, config(dir.path(), FilterMode::Coverage), vec![]);

        let summary = engine.run_trace(Cursor::new("0,0,1,4096,0,0,0,7,0\n")).unwrap();
        assert_eq!(summary.decisions, 1);
        let lines = output(&engine);
        assert!(lines[0].starts_with("4096-"));
        assert!(lines[0].ends_with("-1-0-7-0@none@@"));
        assert_eq!(lines[1], "END@@");
        assert_eq!(engine.stats().traces, 1);
    }

    #[test]
    fn test_trace_and_request() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new(&z3_config(Duration::from_secs(5)));
        let mut engine = HybridEngine::new(&ctx, config(dir.path(), FilterMode::PathPrefix), vec![]);
        fill(engine.table_mut());

        let events = "0,3,1,4096,0,0,0,7,5\n0,5,0,4112,0,0,0,7,5,\n0,5,0,4112,0,1,0,7,5\n";
        let summary = engine.run_trace(Cursor::new(events)).unwrap();
        assert_eq!((summary.qid, summary.tid), (0, 7));
        // the second visit of label 5 is not reported again
        assert_eq!(summary.decisions, 2);
        assert_eq!(engine.table().resolve(5).unwrap().l1, 0);
        assert!(dir.path().join("trees/tree0/id:000007").exists());

        let lines = output(&engine);
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains("-0-5-7-0@"));
        // in0 == 'A' was decided before on the same bytes
        assert!(lines[1].ends_with("#3,1.@@"));
        let prefix_hash: u64 = lines[1]
            .split('@')
            .nth(1)
            .unwrap()
            .split('-')
            .nth(2)
            .unwrap()
            .parse()
            .unwrap();
        assert_ne!(prefix_hash, 0);

        let queue = dir.path().join("afl-slave/queue");
        fs::create_dir_all(&queue).unwrap();
        fs::write(queue.join("id:000007,orig:seed"), b"AB").unwrap();

        let request = SolveRequest {
            qid: 0,
            tree_id: 7,
            label: 5,
            direction: 0,
            cur_label_loc: 0,
            prefix_hash,
            extra: ExtraConstraints::parse_request("3.1#").unwrap(),
        };
        let mut requests = ReaderRequestSource::new(Cursor::new(format!("{request}\n")));
        engine.serve_requests(&mut requests).unwrap();

        assert_eq!(output(&engine).last().unwrap(), "ENDNEW@@");
        let seed = fs::read(dir.path().join("fifo/queue/id:000000")).unwrap();
        assert_eq!(seed, [0x41, 0x3f]);
        assert_eq!(engine.stats().nested, 1);
        // the same prefix again is a duplicate
        assert_eq!(engine.handle_request(&request), ControlToken::EndDup);
    }

    #[test]
    fn test_missing_snapshot_is_dup() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new(&z3_config(Duration::from_secs(5)));
        let mut engine = HybridEngine::new(&ctx, config(dir.path(), FilterMode::Coverage), vec![]);

        let mut requests =
            ReaderRequestSource::new(Cursor::new("0,99,5,0,0,1234,\nnot a request\n"));
        let res = engine.serve_requests(&mut requests);
        assert!(matches!(res, Err(Error::Disconnected(..))));
        assert_eq!(output(&engine), ["ENDDUP@@", "ENDUNSAT@@"]);
        assert_eq!(engine.stats().dup, 1);
        assert_eq!(engine.stats().nested + engine.stats().optimistic, 0);
    }

    #[test]
    fn test_memcmp_events() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new(&z3_config(Duration::from_secs(5)));
        let mut engine = HybridEngine::new(&ctx, config(dir.path(), FilterMode::Coverage), vec![]);
        let solutions = engine.solutions();

        let events = "0,2,4,8192,1,0,2,7,0\n65,66\n0,2,4,8192,1,0,2,7,0\n65,66\n";
        let summary = engine.run_trace(Cursor::new(events)).unwrap();
        assert_eq!(summary.events, 2);
        assert_eq!(summary.decisions, 0);
        assert_eq!(solutions.len(), 1);
        let solution = solutions.pop().unwrap();
        assert_eq!(solution.bytes[&4], b'A');
        assert_eq!(solution.bytes[&5], b'B');
        assert_eq!(solution.addr, 8192);
    }

    #[test]
    fn test_memcmp_save_whole() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new(&z3_config(Duration::from_secs(5)));
        let input = dir.path().join(".cur_input");
        fs::write(&input, b"xxxxxx").unwrap();
        let mut config = config(dir.path(), FilterMode::Coverage);
        config.save_whole = true;
        let mut engine = HybridEngine::new(&ctx, config, vec![]);

        engine
            .run_trace(Cursor::new("0,2,1,8192,1,0,2,7,0\n65,66\n"))
            .unwrap();
        assert!(engine.solutions().is_empty());
        let seed = fs::read(dir.path().join("fifo/queue/id:000000")).unwrap();
        assert_eq!(seed, b"xABxxx");
    }

    #[test]
    fn test_budget_skips_but_consumes_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new(&z3_config(Duration::from_secs(5)));
        let mut config = config(dir.path(), FilterMode::Coverage);
        config.trace_budget = Duration::ZERO;
        let mut engine = HybridEngine::new(&ctx, config, vec![]);

        let events = "0,0,1,4096,0,0,0,7,0\n0,2,1,8192,1,0,2,7,0\n65,66\n0,0,0,4096,0,0,0,7,0\n";
        let summary = engine.run_trace(Cursor::new(events)).unwrap();
        assert_eq!(summary.events, 3);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.decisions, 1);
        assert!(engine.solutions().is_empty());
    }

    #[test]
    fn test_oversized_expressions_are_not_reported() {
        let oversized: [fn(&mut LabelInfo); 2] =
            [|info| info.tree_size = 50_001, |info| info.depth = 501];
        for oversize in oversized {
            let dir = tempfile::tempdir().unwrap();
            let ctx = Context::new(&z3_config(Duration::from_secs(5)));
            let mut engine =
                HybridEngine::new(&ctx, config(dir.path(), FilterMode::Coverage), vec![]);
            fill(engine.table_mut());
            oversize(engine.table_mut().resolve_mut(3).unwrap());

            let summary = engine.run_trace(Cursor::new("0,3,1,4096,0,0,0,7,5\n")).unwrap();
            assert_eq!(summary.decisions, 0);
            assert_eq!(output(&engine), ["END@@"]);
        }
    }

    #[test]
    fn test_malformed_load_keeps_the_trace_alive() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new(&z3_config(Duration::from_secs(5)));
        let mut engine = HybridEngine::new(&ctx, config(dir.path(), FilterMode::Coverage), vec![]);
        let table = engine.table_mut();
        table.set(1, LabelInfo::input(u64::from(u32::MAX))).unwrap();
        table
            .set(2, LabelInfo::new(Operation::Load, 16, 1, 2, 0, 0))
            .unwrap();
        table
            .set(3, LabelInfo::icmp(Predicate::Eq, 16, 2, 0, 0, 7))
            .unwrap();

        let summary = engine.run_trace(Cursor::new("0,3,0,4096,0,0,0,1,3\n")).unwrap();
        assert_eq!(summary.decisions, 1);
        let lines = output(&engine);
        // reported, but without extra constraints
        assert!(lines[0].ends_with("#@@"));
        assert_eq!(lines[1], "END@@");
    }

    #[test]
    fn test_reported_max_label_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new(&z3_config(Duration::from_secs(5)));
        let mut engine = HybridEngine::new(&ctx, config(dir.path(), FilterMode::Coverage), vec![]);
        fill(engine.table_mut());

        let summary = engine
            .run_trace(Cursor::new("0,0,0,4096,0,0,0,1,4000000000\n"))
            .unwrap();
        assert_eq!(summary.tid, 1);
        let snapshot = dir.path().join("trees/tree0/id:000001");
        assert_eq!(
            fs::metadata(snapshot).unwrap().len(),
            6 * LABEL_INFO_SIZE as u64
        );
        assert_eq!(output(&engine).last().unwrap(), "END@@");
    }
}
