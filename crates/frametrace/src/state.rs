//! Process-wide tracer state.
//!
//! Everything the engine remembers between calls lives in one [`TracerState`]
//! that callers create and pass around: the code registry, the per-call-site
//! caches, the continuation cache, compiled graphs, counters and the
//! configuration. [`TracerState::reset`] returns it to a fresh state.
//!
//! Cached entries are published as immutable lists. A lookup clones the list
//! under a short read lock and evaluates guards without holding any lock, so
//! frames keep running while another thread compiles.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use ahash::AHashMap;
use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use strum::{EnumCount, IntoEnumIterator};

use crate::{
    backend::CompiledGraph,
    bytecode::CodeUnit,
    config::{Config, ConfigError},
    eval_frame::CapturedFrame,
    guards::GuardSet,
};

/// Deferred work run when a cache entry is discarded.
pub type Cleanup = Box<dyn FnOnce() + Send + Sync>;

/// A stable reference to a registered code unit.
///
/// Handles from before a [`TracerState::reset`] are stale and resolve to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeHandle {
    index: u32,
    generation: u64,
}

/// What the engine knows about a code unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeFlags {
    /// A conversion of this code was attempted.
    pub input: bool,
    /// Produced by a conversion; never converted again.
    pub output: bool,
    /// Never traced.
    pub skip: bool,
    /// Traced even when no tensor reaches the frame.
    pub always_trace: bool,
}

#[derive(Debug)]
struct CodeRecord {
    code: Arc<CodeUnit>,
    flags: CodeFlags,
}

#[derive(Debug, Default)]
struct CodeRegistry {
    generation: u64,
    records: Vec<CodeRecord>,
    by_serial: AHashMap<u64, u32>,
}

impl CodeRegistry {
    fn register(&mut self, code: &Arc<CodeUnit>) -> CodeHandle {
        let index = match self.by_serial.get(&code.serial()) {
            Some(index) => *index,
            None => {
                let index = u32::try_from(self.records.len()).unwrap_or(u32::MAX);
                self.records.push(CodeRecord {
                    code: Arc::clone(code),
                    flags: CodeFlags::default(),
                });
                self.by_serial.insert(code.serial(), index);
                index
            }
        };
        CodeHandle {
            index,
            generation: self.generation,
        }
    }

    fn flags(&self, code: &CodeUnit) -> CodeFlags {
        self.by_serial
            .get(&code.serial())
            .and_then(|index| self.records.get(*index as usize))
            .map(|record| record.flags)
            .unwrap_or_default()
    }

    fn update(&mut self, code: &Arc<CodeUnit>, f: impl FnOnce(&mut CodeFlags)) {
        let handle = self.register(code);
        if let Some(record) = self.records.get_mut(handle.index as usize) {
            f(&mut record.flags);
        }
    }
}

/// One cached conversion of a call site.
pub struct CacheEntry {
    code: Arc<CodeUnit>,
    guards: GuardSet,
    graphs: Vec<Arc<CompiledGraph>>,
    cleanups: Mutex<Vec<Cleanup>>,
}

impl CacheEntry {
    #[must_use]
    pub fn new(code: Arc<CodeUnit>, guards: GuardSet, graphs: Vec<Arc<CompiledGraph>>) -> Self {
        Self {
            code,
            guards,
            graphs,
            cleanups: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_cleanup(self, cleanup: Cleanup) -> Self {
        self.cleanups.lock().push(cleanup);
        self
    }

    /// The rewritten code run when the guards pass.
    #[must_use]
    pub fn code(&self) -> &Arc<CodeUnit> {
        &self.code
    }

    #[must_use]
    pub fn guards(&self) -> &GuardSet {
        &self.guards
    }

    /// Graphs called by [`code`](Self::code).
    #[must_use]
    pub fn graphs(&self) -> &[Arc<CompiledGraph>] {
        &self.graphs
    }

    fn run_cleanups(&self) {
        let cleanups = std::mem::take(&mut *self.cleanups.lock());
        for cleanup in cleanups {
            cleanup();
        }
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("code", &self.code.describe())
            .field("guards", &self.guards.len())
            .field("graphs", &self.graphs)
            .finish_non_exhaustive()
    }
}

type EntryList = Arc<[Arc<CacheEntry>]>;

/// Identifies a continuation: join points reached from several branches share one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ResumeKey {
    /// Serial of the user-written code the continuation replays.
    pub root: u64,
    /// Offset in the root code where execution continues.
    pub offset: u32,
    pub stack_depth: usize,
    pub argnames: Vec<String>,
    /// Stack slots that receive an iterator.
    pub iter_slots: Vec<usize>,
}

/// Things the engine counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumCount, strum::EnumIter)]
pub enum Event {
    FrameSeen,
    FrameConverted,
    CacheHit,
    CacheMiss,
    GraphBreak,
    Restart,
    Unsupported,
    Skipped,
    GraphCompiled,
}

/// Snapshot of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub frames_seen: usize,
    pub frames_converted: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub graph_breaks: usize,
    pub restarts: usize,
    pub unsupported: usize,
    pub skipped: usize,
    pub compiled_graphs: usize,
    pub ops_captured: usize,
}

/// The engine's memory. See the module docs.
pub struct TracerState {
    config: RwLock<Config>,
    codes: RwLock<CodeRegistry>,
    cache: RwLock<AHashMap<u64, EntryList>>,
    resumes: Mutex<AHashMap<ResumeKey, Arc<CodeUnit>>>,
    guard_failures: Mutex<AHashMap<u64, String>>,
    graphs: Mutex<IndexMap<String, Arc<CompiledGraph>>>,
    graph_counter: AtomicUsize,
    resume_counter: AtomicUsize,
    counters: [AtomicUsize; Event::COUNT],
    ops_captured: AtomicUsize,
    compile_lock: Mutex<()>,
}

impl TracerState {
    #[must_use]
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config: RwLock::new(config),
            codes: RwLock::new(CodeRegistry::default()),
            cache: RwLock::new(AHashMap::new()),
            resumes: Mutex::new(AHashMap::new()),
            guard_failures: Mutex::new(AHashMap::new()),
            graphs: Mutex::new(IndexMap::new()),
            graph_counter: AtomicUsize::new(0),
            resume_counter: AtomicUsize::new(0),
            counters: std::array::from_fn(|_| AtomicUsize::new(0)),
            ops_captured: AtomicUsize::new(0),
            compile_lock: Mutex::new(()),
        })
    }

    /// State with the default configuration plus environment overrides.
    pub fn from_env() -> Result<Arc<Self>, ConfigError> {
        Ok(Self::new(Config::from_env()?))
    }

    /// A copy of the current configuration.
    #[must_use]
    pub fn config(&self) -> Config {
        self.config.read().clone()
    }

    pub fn update_config(&self, f: impl FnOnce(&mut Config)) {
        f(&mut self.config.write());
    }

    pub fn set_option(&self, name: &str, value: &str) -> Result<(), ConfigError> {
        self.config.write().set_option(name, value)
    }

    // code registry

    pub fn handle(&self, code: &Arc<CodeUnit>) -> CodeHandle {
        self.codes.write().register(code)
    }

    #[must_use]
    pub fn is_live(&self, handle: CodeHandle) -> bool {
        handle.generation == self.codes.read().generation
    }

    #[must_use]
    pub fn code(&self, handle: CodeHandle) -> Option<Arc<CodeUnit>> {
        let codes = self.codes.read();
        if handle.generation != codes.generation {
            return None;
        }
        codes.records.get(handle.index as usize).map(|record| Arc::clone(&record.code))
    }

    #[must_use]
    pub fn flags(&self, code: &CodeUnit) -> CodeFlags {
        self.codes.read().flags(code)
    }

    pub fn mark_input(&self, code: &Arc<CodeUnit>) {
        self.codes.write().update(code, |flags| flags.input = true);
    }

    pub fn mark_output(&self, code: &Arc<CodeUnit>) {
        self.codes.write().update(code, |flags| flags.output = true);
    }

    pub fn mark_skip(&self, code: &Arc<CodeUnit>) {
        self.codes.write().update(code, |flags| flags.skip = true);
    }

    pub fn mark_always_trace(&self, code: &Arc<CodeUnit>) {
        self.codes.write().update(code, |flags| flags.always_trace = true);
    }

    #[must_use]
    pub fn is_output(&self, code: &CodeUnit) -> bool {
        self.flags(code).output
    }

    #[must_use]
    pub fn is_skipped(&self, code: &CodeUnit) -> bool {
        self.flags(code).skip
    }

    #[must_use]
    pub fn is_always_trace(&self, code: &CodeUnit) -> bool {
        self.flags(code).always_trace
    }

    // cache

    fn entries(&self, code: &CodeUnit) -> Option<EntryList> {
        self.cache.read().get(&code.serial()).cloned()
    }

    /// The entry another conversion installed for `frame`, if any. Misses are
    /// not recorded; the caller already counted one.
    pub(crate) fn recheck(&self, frame: &CapturedFrame<'_>) -> Option<Arc<CodeUnit>> {
        let entries = self.entries(frame.code())?;
        let entry = entries
            .iter()
            .find(|entry| entry.guards.check(frame.locals(), frame.globals()))?;
        self.record(Event::CacheHit);
        Some(Arc::clone(&entry.code))
    }

    /// The code of the newest entry whose guards pass for `frame`.
    ///
    /// When entries exist but none passes, the failing guard of the newest one
    /// becomes the call site's most recent guard failure.
    #[must_use]
    pub fn lookup(&self, frame: &CapturedFrame<'_>) -> Option<Arc<CodeUnit>> {
        let entries = self.entries(frame.code())?;
        let hit = entries
            .iter()
            .find(|entry| entry.guards.check(frame.locals(), frame.globals()));
        if let Some(entry) = hit {
            self.record(Event::CacheHit);
            return Some(Arc::clone(&entry.code));
        }
        self.record(Event::CacheMiss);
        if let Some(reason) = entries
            .first()
            .and_then(|newest| newest.guards.failure(frame.locals(), frame.globals()))
        {
            log::debug!(target: "frametrace", "guard failed for {}: {reason}", frame.code().describe());
            self.record_guard_failure(frame.code(), reason);
        }
        None
    }

    /// Publishes `entry` as the newest entry of `code`'s call site.
    pub fn install(&self, code: &CodeUnit, entry: CacheEntry) -> Arc<CacheEntry> {
        let entry = Arc::new(entry);
        let mut cache = self.cache.write();
        let list: EntryList = std::iter::once(Arc::clone(&entry))
            .chain(cache.get(&code.serial()).into_iter().flat_map(|old| old.iter().cloned()))
            .collect();
        cache.insert(code.serial(), list);
        entry
    }

    /// Entries of a call site, newest first.
    #[must_use]
    pub fn cache_entries(&self, code: &CodeUnit) -> Vec<Arc<CacheEntry>> {
        self.entries(code).map(|list| list.to_vec()).unwrap_or_default()
    }

    #[must_use]
    pub fn cache_size(&self, code: &CodeUnit) -> usize {
        self.entries(code).map_or(0, |list| list.len())
    }

    /// Drops every entry of a call site.
    pub fn clear_code(&self, code: &CodeUnit) {
        let removed = self.cache.write().remove(&code.serial());
        for entry in removed.iter().flat_map(|list| list.iter()) {
            entry.run_cleanups();
        }
    }

    // continuations

    pub(crate) fn resume(&self, key: &ResumeKey) -> Option<Arc<CodeUnit>> {
        self.resumes.lock().get(key).cloned()
    }

    /// Stores a continuation, returning the one already cached under `key` if
    /// another conversion got there first.
    pub(crate) fn insert_resume(&self, key: ResumeKey, code: Arc<CodeUnit>) -> Arc<CodeUnit> {
        Arc::clone(self.resumes.lock().entry(key).or_insert(code))
    }

    #[must_use]
    pub fn resume_count(&self) -> usize {
        self.resumes.lock().len()
    }

    pub(crate) fn next_resume_name(&self, offset: u32) -> String {
        let n = self.resume_counter.fetch_add(1, Ordering::Relaxed);
        format!("__resume_at_{offset}_{n}")
    }

    // guard failures

    pub fn record_guard_failure(&self, code: &CodeUnit, reason: String) {
        self.guard_failures.lock().insert(code.serial(), reason);
    }

    #[must_use]
    pub fn last_guard_failure(&self, code: &CodeUnit) -> Option<String> {
        self.guard_failures.lock().get(&code.serial()).cloned()
    }

    // compiled graphs

    pub(crate) fn next_graph_name(&self) -> String {
        let n = self.graph_counter.fetch_add(1, Ordering::Relaxed);
        format!("__compiled_fn_{n}")
    }

    pub fn register_graph(&self, graph: Arc<CompiledGraph>) {
        self.record(Event::GraphCompiled);
        self.ops_captured.fetch_add(graph.graph().op_count(), Ordering::Relaxed);
        self.graphs.lock().insert(graph.name().to_owned(), graph);
    }

    pub fn unregister_graph(&self, name: &str) {
        self.graphs.lock().shift_remove(name);
    }

    #[must_use]
    pub fn graph(&self, name: &str) -> Option<Arc<CompiledGraph>> {
        self.graphs.lock().get(name).cloned()
    }

    /// Live compiled graphs in compilation order.
    #[must_use]
    pub fn graphs(&self) -> Vec<Arc<CompiledGraph>> {
        self.graphs.lock().values().cloned().collect()
    }

    // counters

    pub fn record(&self, event: Event) {
        self.counters[event as usize].fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn count(&self, event: Event) -> usize {
        self.counters[event as usize].load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn stats(&self) -> Stats {
        let mut stats = Stats {
            ops_captured: self.ops_captured.load(Ordering::Relaxed),
            ..Stats::default()
        };
        for event in Event::iter() {
            let value = self.count(event);
            let field = match event {
                Event::FrameSeen => &mut stats.frames_seen,
                Event::FrameConverted => &mut stats.frames_converted,
                Event::CacheHit => &mut stats.cache_hits,
                Event::CacheMiss => &mut stats.cache_misses,
                Event::GraphBreak => &mut stats.graph_breaks,
                Event::Restart => &mut stats.restarts,
                Event::Unsupported => &mut stats.unsupported,
                Event::Skipped => &mut stats.skipped,
                Event::GraphCompiled => &mut stats.compiled_graphs,
            };
            *field = value;
        }
        stats
    }

    /// Serializes conversions. Interpreter values never leave their thread, but
    /// code units and this state are shared, so threads running the same
    /// program can reach one call site together. Not re-entrant; conversions
    /// run with interception disabled.
    pub(crate) fn compile_lock(&self) -> MutexGuard<'_, ()> {
        self.compile_lock.lock()
    }

    /// Forgets everything: caches (running their cleanups), code flags,
    /// continuations, graphs and counters. Outstanding [`CodeHandle`]s go stale.
    /// The configuration is kept.
    pub fn reset(&self) {
        let _compiling = self.compile_lock();
        let cache = std::mem::take(&mut *self.cache.write());
        for entry in cache.values().flat_map(|list| list.iter()) {
            entry.run_cleanups();
        }
        {
            let mut codes = self.codes.write();
            let generation = codes.generation + 1;
            *codes = CodeRegistry {
                generation,
                ..CodeRegistry::default()
            };
        }
        self.resumes.lock().clear();
        self.guard_failures.lock().clear();
        self.graphs.lock().clear();
        self.graph_counter.store(0, Ordering::Relaxed);
        self.resume_counter.store(0, Ordering::Relaxed);
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
        self.ops_captured.store(0, Ordering::Relaxed);
        log::debug!(target: "frametrace", "tracer state reset");
    }
}

impl fmt::Debug for TracerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracerState")
            .field("config", &*self.config.read())
            .field("call_sites", &self.cache.read().len())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        bytecode::{CodeBuilder, Const, Opcode},
        guards::{Guard, GuardKind, Literal, Source},
        value::{Value, new_globals},
    };

    fn code(name: &str) -> Arc<CodeUnit> {
        let mut builder = CodeBuilder::default();
        let none = builder.add_const(Const::None);
        builder.add_varname("n");
        builder.emit(Opcode::LoadConst(none));
        builder.emit(Opcode::ReturnValue);
        builder.build(name, "test.py", 1, 1, false)
    }

    fn entry_for(n: i64) -> CacheEntry {
        let guards = GuardSet::build([Guard::new(Source::local("n", 0), GuardKind::ValueMatch(Literal::Int(n)))]);
        CacheEntry::new(code("rewritten"), guards, Vec::new())
    }

    #[test]
    fn lookup_prefers_newest_and_records_failures() {
        let state = TracerState::new(Config::default());
        let f = code("f");
        let first = state.install(&f, entry_for(1));
        let second = state.install(&f, entry_for(2));
        assert_eq!(state.cache_size(&f), 2);
        assert!(Arc::ptr_eq(&state.cache_entries(&f)[0], &second));

        let globals = new_globals();
        let locals = [Some(Value::Int(1))];
        let hit = state.lookup(&CapturedFrame::new(&f, &locals, &globals));
        assert!(hit.is_some_and(|c| Arc::ptr_eq(&c, first.code())));

        let locals = [Some(Value::Int(3))];
        assert!(state.lookup(&CapturedFrame::new(&f, &locals, &globals)).is_none());
        assert_eq!(state.last_guard_failure(&f).as_deref(), Some("L['n'] VALUE_MATCH 2"));
        let stats = state.stats();
        assert_eq!((stats.cache_hits, stats.cache_misses), (1, 1));
    }

    #[test]
    fn reset_runs_cleanups_and_invalidates_handles() {
        let state = TracerState::new(Config::default());
        let f = code("f");
        let cleaned = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cleaned);
        state.install(&f, entry_for(1).with_cleanup(Box::new(move || flag.store(true, Ordering::SeqCst))));
        state.mark_skip(&f);
        let handle = state.handle(&f);
        assert!(state.code(handle).is_some());

        state.reset();
        assert!(cleaned.load(Ordering::SeqCst));
        assert_eq!(state.cache_size(&f), 0);
        assert!(!state.is_skipped(&f));
        assert!(!state.is_live(handle));
        assert!(state.code(handle).is_none());
        assert!(state.is_live(state.handle(&f)));
    }

    #[test]
    fn continuations_are_shared() {
        let state = TracerState::new(Config::default());
        let key = ResumeKey {
            root: 1,
            offset: 4,
            stack_depth: 0,
            argnames: vec!["x".to_owned()],
            iter_slots: Vec::new(),
        };
        let first = state.insert_resume(key.clone(), code("a"));
        let second = state.insert_resume(key.clone(), code("b"));
        assert!(Arc::ptr_eq(&first, &second));
        assert!(state.resume(&key).is_some());
        assert_eq!(state.resume_count(), 1);
        assert_eq!(state.next_graph_name(), "__compiled_fn_0");
        assert_eq!(state.next_resume_name(4), "__resume_at_4_0");
    }

    #[test]
    fn configuration_is_shared() {
        let state = TracerState::new(Config::default());
        state.set_option("cache_size_limit", "2").unwrap();
        state.update_config(|config| config.dynamic_shapes = true);
        let config = state.config();
        assert_eq!(config.cache_size_limit, 2);
        assert!(config.dynamic_shapes);
        assert!(state.set_option("nope", "1").is_err());
    }
}
