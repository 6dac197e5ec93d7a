//! Hook admission scheduler.
//!
//! Every hook walks an ordered chain of scopes. Each scope applies its policy
//! and either promotes the hook to the next scope (dispatch after the last
//! one) or cancels it. When a hook settles, every scope it entered is told,
//! and a scope with no hooks left is dropped from the registry.
//!
//! The runtime does no I/O: it returns [`Effect`]s for the host to perform.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::timer::{TimerToken, TimerTokens};

/// Host-assigned hook identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookId(pub u64);

impl fmt::Display for HookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hook#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct ScopeId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    Free,
    Blocking,
    Serial,
    Debounce,
    Frame,
    Latest,
    Concurrent,
    Priority,
}

/// Admission policy plus the per-hook option it was submitted with.
#[derive(Debug, Clone, PartialEq)]
pub enum Policy {
    Free,
    /// Cancel the incoming hook while another one is inside.
    Blocking,
    /// FIFO, one at a time.
    Serial,
    /// Dispatch the newest hook once arrivals pause for `duration`, or at
    /// the latest `limit` after the first pending arrival.
    Debounce {
        duration: Duration,
        limit: Option<Duration>,
    },
    /// A frame hook waits until it is alone in the scope and blocks
    /// arrivals until it settles.
    Frame { frame: bool },
    /// The newest hook cancels the previous one.
    Latest,
    /// Hooks of one group run together; other groups are canceled.
    Concurrent { group: i64 },
    /// Higher levels cancel lower ones; lower arrivals are canceled.
    Priority { level: i64 },
}

impl Policy {
    pub fn kind(&self) -> ScopeKind {
        match self {
            Policy::Free => ScopeKind::Free,
            Policy::Blocking => ScopeKind::Blocking,
            Policy::Serial => ScopeKind::Serial,
            Policy::Debounce { .. } => ScopeKind::Debounce,
            Policy::Frame { .. } => ScopeKind::Frame,
            Policy::Latest => ScopeKind::Latest,
            Policy::Concurrent { .. } => ScopeKind::Concurrent,
            Policy::Priority { .. } => ScopeKind::Priority,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScopeSpecError {
    #[error("scope kind must be a string, got {0}")]
    Shape(Value),
    #[error("unknown scope kind {0:?}")]
    UnknownKind(String),
    #[error("scope key must be a string or number, got {0}")]
    Key(Value),
    #[error("invalid option for {kind} scope: {opt}")]
    Option { kind: &'static str, opt: Value },
}

/// One link of a hook's scope chain, e.g. `["debounce", "search", [300, 1000]]`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Vec<Value>")]
pub struct ScopeSet {
    pub key: String,
    pub policy: Policy,
}

impl ScopeSet {
    pub fn new(key: impl Into<String>, policy: Policy) -> Self {
        Self {
            key: key.into(),
            policy,
        }
    }

    /// Chain used when a hook names no scopes.
    pub fn default_chain() -> Vec<ScopeSet> {
        vec![ScopeSet::new("", Policy::Free)]
    }
}

impl TryFrom<Vec<Value>> for ScopeSet {
    type Error = ScopeSpecError;

    fn try_from(items: Vec<Value>) -> Result<Self, Self::Error> {
        let mut items = items.into_iter();
        let kind = match items.next() {
            Some(Value::String(kind)) => kind,
            other => return Err(ScopeSpecError::Shape(other.unwrap_or(Value::Null))),
        };
        let key = items.next().unwrap_or(Value::Null);
        let opt = items.next().unwrap_or(Value::Null);
        let key = match key {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            other => return Err(ScopeSpecError::Key(other)),
        };
        let policy = match kind.as_str() {
            "free" => Policy::Free,
            "blocking" => Policy::Blocking,
            "serial" => Policy::Serial,
            "latest" => Policy::Latest,
            "debounce" => parse_debounce(&opt)?,
            "frame" => Policy::Frame {
                frame: opt.as_bool().unwrap_or(false),
            },
            "concurrent" => Policy::Concurrent {
                group: opt.as_i64().ok_or(ScopeSpecError::Option {
                    kind: "concurrent",
                    opt: opt.clone(),
                })?,
            },
            "priority" => Policy::Priority {
                level: opt.as_i64().ok_or(ScopeSpecError::Option {
                    kind: "priority",
                    opt: opt.clone(),
                })?,
            },
            _ => return Err(ScopeSpecError::UnknownKind(kind)),
        };
        Ok(ScopeSet { key, policy })
    }
}

/// `[duration_ms, limit_ms]`; a zero limit means none.
fn parse_debounce(opt: &Value) -> Result<Policy, ScopeSpecError> {
    let bad = || ScopeSpecError::Option {
        kind: "debounce",
        opt: opt.clone(),
    };
    let items = opt.as_array().ok_or_else(bad)?;
    let duration = items.first().and_then(Value::as_u64).ok_or_else(bad)?;
    let limit = match items.get(1) {
        None | Some(Value::Null) => 0,
        Some(v) => v.as_u64().ok_or_else(bad)?,
    };
    Ok(Policy::Debounce {
        duration: Duration::from_millis(duration),
        limit: (limit > 0).then(|| Duration::from_millis(limit)),
    })
}

/// Work for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Every scope admitted the hook: issue its request.
    Dispatch(HookId),
    /// Rejected before dispatch; no request must be made.
    Canceled(HookId),
    /// Canceled after dispatch: abort the request, then report `complete`.
    Abort(HookId),
    ArmTimer { token: TimerToken, after: Duration },
    DisarmTimer(TimerToken),
}

enum Decision {
    Promote(HookId),
    Cancel(HookId),
    Arm(TimerToken, Duration),
    Disarm(TimerToken),
}

/// Decisions collected while one scope runs its policy.
struct Step<'a> {
    tokens: &'a mut TimerTokens,
    out: Vec<Decision>,
}

impl Step<'_> {
    fn promote(&mut self, hook: HookId) {
        self.out.push(Decision::Promote(hook));
    }

    fn cancel(&mut self, hook: HookId) {
        self.out.push(Decision::Cancel(hook));
    }

    fn arm(&mut self, after: Duration) -> TimerToken {
        let token = self.tokens.issue();
        self.out.push(Decision::Arm(token, after));
        token
    }

    fn disarm(&mut self, token: Option<TimerToken>) {
        if let Some(token) = token {
            self.out.push(Decision::Disarm(token));
        }
    }
}

enum ScopeState {
    Free,
    Blocking,
    Serial {
        queue: VecDeque<HookId>,
    },
    Debounce {
        pending: Option<HookId>,
        duration: Option<TimerToken>,
        limit: Option<TimerToken>,
    },
    Frame {
        frame_hook: Option<HookId>,
        promoted: bool,
    },
    Latest {
        last: Option<HookId>,
    },
    Concurrent {
        groups: BTreeMap<HookId, i64>,
    },
    Priority {
        levels: BTreeMap<HookId, i64>,
    },
}

impl ScopeState {
    fn new(kind: ScopeKind) -> Self {
        match kind {
            ScopeKind::Free => ScopeState::Free,
            ScopeKind::Blocking => ScopeState::Blocking,
            ScopeKind::Serial => ScopeState::Serial {
                queue: VecDeque::new(),
            },
            ScopeKind::Debounce => ScopeState::Debounce {
                pending: None,
                duration: None,
                limit: None,
            },
            ScopeKind::Frame => ScopeState::Frame {
                frame_hook: None,
                promoted: false,
            },
            ScopeKind::Latest => ScopeState::Latest { last: None },
            ScopeKind::Concurrent => ScopeState::Concurrent {
                groups: BTreeMap::new(),
            },
            ScopeKind::Priority => ScopeState::Priority {
                levels: BTreeMap::new(),
            },
        }
    }

    /// A hook entered; `size` already counts it.
    fn process(&mut self, size: usize, hook: HookId, policy: &Policy, step: &mut Step<'_>) {
        match (self, policy) {
            (ScopeState::Free, _) => step.promote(hook),
            (ScopeState::Blocking, _) => {
                if size > 1 {
                    step.cancel(hook);
                } else {
                    step.promote(hook);
                }
            }
            (ScopeState::Serial { queue }, _) => {
                queue.push_back(hook);
                if queue.len() == 1 {
                    step.promote(hook);
                }
            }
            (
                ScopeState::Debounce {
                    pending,
                    duration,
                    limit,
                },
                Policy::Debounce {
                    duration: wait,
                    limit: cap,
                },
            ) => {
                if let Some(old) = pending.replace(hook) {
                    step.cancel(old);
                }
                step.disarm(duration.take());
                *duration = Some(step.arm(*wait));
                if limit.is_none() {
                    if let Some(cap) = cap {
                        *limit = Some(step.arm(*cap));
                    }
                }
            }
            (
                ScopeState::Frame {
                    frame_hook,
                    promoted,
                },
                Policy::Frame { frame },
            ) => {
                if frame_hook.is_some() {
                    step.cancel(hook);
                    return;
                }
                if !*frame {
                    step.promote(hook);
                    return;
                }
                *frame_hook = Some(hook);
                *promoted = size == 1;
                if *promoted {
                    step.promote(hook);
                }
            }
            (ScopeState::Latest { last }, _) => {
                if let Some(old) = last.replace(hook) {
                    step.cancel(old);
                }
                step.promote(hook);
            }
            (ScopeState::Concurrent { groups }, Policy::Concurrent { group }) => {
                if groups.values().any(|g| g != group) {
                    step.cancel(hook);
                    return;
                }
                groups.insert(hook, *group);
                step.promote(hook);
            }
            (ScopeState::Priority { levels }, Policy::Priority { level }) => {
                if levels.values().any(|l| l > level) {
                    step.cancel(hook);
                    return;
                }
                levels.retain(|other, l| {
                    if *l < *level {
                        step.cancel(*other);
                        return false;
                    }
                    true
                });
                levels.insert(hook, *level);
                step.promote(hook);
            }
            (_, policy) => {
                warn!(%hook, ?policy, "option does not match scope kind, admitting");
                step.promote(hook);
            }
        }
    }

    /// A hook that entered has settled; `size` no longer counts it.
    fn complete(&mut self, size: usize, hook: HookId, step: &mut Step<'_>) {
        match self {
            ScopeState::Free | ScopeState::Blocking => {}
            ScopeState::Serial { queue } => {
                if queue.front() == Some(&hook) {
                    queue.pop_front();
                    if let Some(next) = queue.front() {
                        step.promote(*next);
                    }
                } else {
                    queue.retain(|h| *h != hook);
                }
            }
            ScopeState::Debounce {
                pending,
                duration,
                limit,
            } => {
                if *pending == Some(hook) {
                    *pending = None;
                    step.disarm(duration.take());
                    step.disarm(limit.take());
                }
            }
            ScopeState::Frame {
                frame_hook,
                promoted,
            } => {
                let Some(waiting) = *frame_hook else {
                    return;
                };
                if waiting == hook {
                    *frame_hook = None;
                    *promoted = false;
                    return;
                }
                if size == 1 && !*promoted {
                    *promoted = true;
                    step.promote(waiting);
                }
            }
            ScopeState::Latest { last } => {
                if *last == Some(hook) {
                    *last = None;
                }
            }
            ScopeState::Concurrent { groups } => {
                groups.remove(&hook);
            }
            ScopeState::Priority { levels } => {
                levels.remove(&hook);
            }
        }
    }

    fn on_timer(&mut self, token: TimerToken, step: &mut Step<'_>) {
        if let ScopeState::Debounce {
            pending,
            duration,
            limit,
        } = self
        {
            if *duration != Some(token) && *limit != Some(token) {
                return;
            }
            let duration = duration.take();
            let limit = limit.take();
            step.disarm(duration.filter(|t| *t != token));
            step.disarm(limit.filter(|t| *t != token));
            if let Some(hook) = pending.take() {
                step.promote(hook);
            }
        }
    }
}

struct Scope {
    kind: ScopeKind,
    key: String,
    counter: usize,
    state: ScopeState,
}

struct HookEntry {
    /// Scopes not entered yet.
    chain: VecDeque<ScopeSet>,
    /// Scopes entered, in order.
    entered: Vec<ScopeId>,
    dispatched: bool,
    aborting: bool,
}

enum Op {
    Advance(HookId),
    Cancel(HookId),
    Unwind(HookId),
}

/// Scope registry plus the hooks currently moving through it.
#[derive(Default)]
pub struct Runtime {
    registry: HashMap<(ScopeKind, String), ScopeId>,
    scopes: HashMap<ScopeId, Scope>,
    hooks: HashMap<HookId, HookEntry>,
    timers: HashMap<TimerToken, ScopeId>,
    tokens: TimerTokens,
    next_scope: u64,
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route a new hook through `chain` (the default free scope if empty).
    pub fn submit(&mut self, hook: HookId, chain: Vec<ScopeSet>) -> Vec<Effect> {
        if self.hooks.contains_key(&hook) {
            warn!(%hook, "hook submitted twice");
            return Vec::new();
        }
        let chain = if chain.is_empty() {
            ScopeSet::default_chain()
        } else {
            chain
        };
        self.hooks.insert(
            hook,
            HookEntry {
                chain: chain.into(),
                entered: Vec::new(),
                dispatched: false,
                aborting: false,
            },
        );
        self.run(Op::Advance(hook))
    }

    /// Cancel a hook: rejected at once if not dispatched, aborted otherwise.
    pub fn cancel(&mut self, hook: HookId) -> Vec<Effect> {
        self.run(Op::Cancel(hook))
    }

    /// A dispatched hook settled (ok, error or aborted).
    pub fn complete(&mut self, hook: HookId) -> Vec<Effect> {
        self.run(Op::Unwind(hook))
    }

    pub fn on_timer(&mut self, token: TimerToken) -> Vec<Effect> {
        let Some(sid) = self.timers.remove(&token) else {
            return Vec::new();
        };
        let Some(scope) = self.scopes.get_mut(&sid) else {
            return Vec::new();
        };
        let mut step = Step {
            tokens: &mut self.tokens,
            out: Vec::new(),
        };
        scope.state.on_timer(token, &mut step);
        let decisions = step.out;
        let mut effects = Vec::new();
        let mut ops = VecDeque::new();
        self.apply(sid, decisions, &mut ops, &mut effects);
        self.drive(ops, &mut effects);
        effects
    }

    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_dispatched(&self, hook: HookId) -> bool {
        self.hooks.get(&hook).is_some_and(|h| h.dispatched)
    }

    fn run(&mut self, op: Op) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.drive(VecDeque::from([op]), &mut effects);
        effects
    }

    fn drive(&mut self, mut ops: VecDeque<Op>, effects: &mut Vec<Effect>) {
        while let Some(op) = ops.pop_front() {
            match op {
                Op::Advance(hook) => self.advance(hook, &mut ops, effects),
                Op::Cancel(hook) => {
                    let Some(entry) = self.hooks.get_mut(&hook) else {
                        continue;
                    };
                    if entry.dispatched {
                        if !entry.aborting {
                            entry.aborting = true;
                            debug!(%hook, "aborting dispatched hook");
                            effects.push(Effect::Abort(hook));
                        }
                        continue;
                    }
                    debug!(%hook, "hook canceled");
                    effects.push(Effect::Canceled(hook));
                    ops.push_back(Op::Unwind(hook));
                }
                Op::Unwind(hook) => self.unwind(hook, &mut ops, effects),
            }
        }
    }

    fn advance(&mut self, hook: HookId, ops: &mut VecDeque<Op>, effects: &mut Vec<Effect>) {
        let Some(entry) = self.hooks.get_mut(&hook) else {
            return;
        };
        if entry.dispatched {
            return;
        }
        let Some(set) = entry.chain.pop_front() else {
            entry.dispatched = true;
            debug!(%hook, "dispatch");
            effects.push(Effect::Dispatch(hook));
            return;
        };
        let kind = set.policy.kind();
        let sid = match self.registry.get(&(kind, set.key.clone())) {
            Some(sid) => *sid,
            None => {
                self.next_scope += 1;
                let sid = ScopeId(self.next_scope);
                self.registry.insert((kind, set.key.clone()), sid);
                self.scopes.insert(
                    sid,
                    Scope {
                        kind,
                        key: set.key.clone(),
                        counter: 0,
                        state: ScopeState::new(kind),
                    },
                );
                sid
            }
        };
        entry.entered.push(sid);
        let Some(scope) = self.scopes.get_mut(&sid) else {
            return;
        };
        scope.counter += 1;
        let mut step = Step {
            tokens: &mut self.tokens,
            out: Vec::new(),
        };
        scope
            .state
            .process(scope.counter, hook, &set.policy, &mut step);
        let decisions = step.out;
        self.apply(sid, decisions, ops, effects);
    }

    fn unwind(&mut self, hook: HookId, ops: &mut VecDeque<Op>, effects: &mut Vec<Effect>) {
        let Some(entry) = self.hooks.remove(&hook) else {
            return;
        };
        for sid in entry.entered.into_iter().rev() {
            let Some(scope) = self.scopes.get_mut(&sid) else {
                continue;
            };
            scope.counter = scope.counter.saturating_sub(1);
            let mut step = Step {
                tokens: &mut self.tokens,
                out: Vec::new(),
            };
            scope.state.complete(scope.counter, hook, &mut step);
            let decisions = step.out;
            let empty = scope.counter == 0;
            self.apply(sid, decisions, ops, effects);
            if empty {
                self.drop_scope(sid, effects);
            }
        }
    }

    fn apply(
        &mut self,
        sid: ScopeId,
        decisions: Vec<Decision>,
        ops: &mut VecDeque<Op>,
        effects: &mut Vec<Effect>,
    ) {
        for decision in decisions {
            match decision {
                Decision::Promote(hook) => ops.push_back(Op::Advance(hook)),
                Decision::Cancel(hook) => ops.push_back(Op::Cancel(hook)),
                Decision::Arm(token, after) => {
                    self.timers.insert(token, sid);
                    effects.push(Effect::ArmTimer { token, after });
                }
                Decision::Disarm(token) => {
                    if self.timers.remove(&token).is_some() {
                        effects.push(Effect::DisarmTimer(token));
                    }
                }
            }
        }
    }

    fn drop_scope(&mut self, sid: ScopeId, effects: &mut Vec<Effect>) {
        let Some(scope) = self.scopes.remove(&sid) else {
            return;
        };
        let key = (scope.kind, scope.key);
        if self.registry.get(&key) == Some(&sid) {
            self.registry.remove(&key);
        }
        let stale: Vec<TimerToken> = self
            .timers
            .iter()
            .filter(|(_, s)| **s == sid)
            .map(|(t, _)| *t)
            .collect();
        for token in stale {
            self.timers.remove(&token);
            effects.push(Effect::DisarmTimer(token));
        }
        debug!(key = %key.1, "scope dropped");
    }
}
