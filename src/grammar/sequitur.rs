// Online digram-substitution engine over an arena of symbol nodes
//
// Two invariants are restored after every append:
//   1. digram uniqueness: no (symbol^exp, symbol^exp) pair occurs twice
//   2. rule utility: every rule other than the start rule is used at least
//      twice, counting exponents
//
// Adjacent equal symbols are always folded into one symbol with a larger
// exponent, so a tight loop of N identical calls costs a single symbol.
//
// Rule bodies are doubly linked lists of nodes living in one Vec. Nodes are
// recycled through a free list; pending digram checks carry the node's
// generation so a recycled slot is never mistaken for the node that was
// scheduled.

use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};

pub(crate) type NodeId = usize;

/// Id of the start rule
pub const START_RULE: i32 = 0;

const START_SLOT: usize = 0;

/// One grammar symbol: a terminal (`value >= 0`) or a rule reference
/// (`value < 0`), repeated `exp` times
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol {
    pub value: i32,
    pub exp: u32,
}

impl Symbol {
    pub fn terminal(value: i32, exp: u32) -> Self {
        Self { value, exp }
    }

    pub fn is_terminal(&self) -> bool {
        self.value >= 0
    }
}

type DigramKey = (i32, u32, i32, u32);

#[derive(Debug, Clone)]
struct Node {
    value: i32,
    exp: u32,
    prev: Option<NodeId>,
    next: Option<NodeId>,
    rule: usize,
    gen: u32,
    live: bool,
}

#[derive(Debug, Clone)]
struct Rule {
    id: i32,
    head: Option<NodeId>,
    tail: Option<NodeId>,
    uses: u64,
    live: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct Engine {
    nodes: Vec<Node>,
    free: Vec<NodeId>,
    rules: Vec<Rule>,
    slot_of: FnvHashMap<i32, usize>,
    digrams: FnvHashMap<DigramKey, NodeId>,
    pending: Vec<(NodeId, u32)>,
    next_rule_id: i32,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        let mut engine = Self {
            nodes: Vec::new(),
            free: Vec::new(),
            rules: Vec::new(),
            slot_of: FnvHashMap::default(),
            digrams: FnvHashMap::default(),
            pending: Vec::new(),
            next_rule_id: -1,
        };
        engine.add_rule(START_RULE);
        engine
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    pub fn append(&mut self, terminal: i32) {
        let tail = self.rules[START_SLOT].tail;
        let bump = tail.filter(|&t| {
            let node = &self.nodes[t];
            node.value == terminal && node.exp < u32::MAX
        });

        match bump {
            Some(t) => {
                let before = self.nodes[t].prev;
                self.unindex_opt(before);
                self.nodes[t].exp += 1;
                self.schedule(before);
            }
            None => {
                let id = self.alloc(terminal, 1, START_SLOT);
                self.insert_between(id, tail, None, START_SLOT);
                self.schedule(tail);
            }
        }

        self.settle();
    }

    /// Live rules in creation order, start rule first
    pub fn rule_bodies(&self) -> Vec<(i32, Vec<Symbol>)> {
        self.rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.live)
            .map(|(slot, r)| (r.id, self.body(slot)))
            .collect()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.iter().filter(|r| r.live).count()
    }

    pub fn symbol_count(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// Use count (sum of exponents) of every live non-start rule, plus the
    /// first duplicated digram if any
    pub fn audit(&self) -> (FnvHashMap<i32, u64>, Option<(Symbol, Symbol)>) {
        let mut uses: FnvHashMap<i32, u64> = FnvHashMap::default();
        let mut seen: FnvHashMap<DigramKey, ()> = FnvHashMap::default();
        let mut duplicate = None;

        for (slot, rule) in self.rules.iter().enumerate() {
            if !rule.live {
                continue;
            }
            if slot != START_SLOT {
                uses.entry(rule.id).or_insert(0);
            }
            let mut cursor = rule.head;
            while let Some(id) = cursor {
                let node = &self.nodes[id];
                if node.value < 0 {
                    *uses.entry(node.value).or_insert(0) += node.exp as u64;
                }
                if let Some(key) = self.digram_at(id) {
                    if seen.insert(key, ()).is_some() && duplicate.is_none() {
                        duplicate = Some((
                            Symbol { value: key.0, exp: key.1 },
                            Symbol { value: key.2, exp: key.3 },
                        ));
                    }
                }
                cursor = node.next;
            }
        }

        (uses, duplicate)
    }

    /// Rewrite every terminal through `translate`. Nothing changes if any
    /// terminal fails to translate; the failing terminal is returned.
    pub fn remap_terminals<F>(&mut self, mut translate: F) -> Result<(), i32>
    where
        F: FnMut(i32) -> Option<i32>,
    {
        let mut updates = Vec::new();
        for (id, node) in self.nodes.iter().enumerate() {
            if node.live && node.value >= 0 {
                let mapped = translate(node.value).ok_or(node.value)?;
                updates.push((id, mapped));
            }
        }
        for (id, mapped) in updates {
            self.nodes[id].value = mapped;
        }
        self.rebuild_index();
        Ok(())
    }

    /// Build an engine from explicit rule bodies without re-running
    /// compression. The start rule must be present; references must point to
    /// existing rules and form no cycle.
    pub fn from_rules(rules: Vec<(i32, Vec<Symbol>)>) -> Result<Self, String> {
        let mut engine = Self {
            nodes: Vec::new(),
            free: Vec::new(),
            rules: Vec::new(),
            slot_of: FnvHashMap::default(),
            digrams: FnvHashMap::default(),
            pending: Vec::new(),
            next_rule_id: -1,
        };

        let start = rules
            .iter()
            .position(|(id, _)| *id == START_RULE)
            .ok_or_else(|| "grammar has no start rule".to_string())?;

        // Start rule takes slot 0 regardless of its position in the input
        engine.add_rule(START_RULE);
        for (i, (id, _)) in rules.iter().enumerate() {
            if i == start {
                continue;
            }
            if *id >= 0 {
                return Err(format!("rule id {} is not negative", id));
            }
            if engine.slot_of.contains_key(id) {
                return Err(format!("rule id {} defined twice", id));
            }
            engine.add_rule(*id);
            engine.next_rule_id = engine.next_rule_id.min(id.saturating_sub(1));
        }

        for (id, body) in &rules {
            let slot = engine.slot_of[id];
            let mut tail = None;
            for symbol in body {
                if symbol.exp == 0 {
                    return Err(format!("rule {} has a symbol with exponent 0", id));
                }
                if symbol.value < 0 && !engine.slot_of.contains_key(&symbol.value) {
                    return Err(format!("rule {} references undefined rule {}", id, symbol.value));
                }
                let node = engine.alloc(symbol.value, symbol.exp, slot);
                engine.insert_between(node, tail, None, slot);
                engine.acquire(symbol.value, symbol.exp);
                tail = Some(node);
            }
        }

        engine.ensure_acyclic()?;
        engine.rebuild_index();
        Ok(engine)
    }

    pub fn expand(&self) -> Expansion<'_> {
        Expansion {
            engine: self,
            stack: vec![Frame {
                slot: START_SLOT,
                cursor: self.rules[START_SLOT].head,
                repeats: 1,
            }],
            run: None,
        }
    }

    /// Number of terminals the start rule expands to
    pub fn expanded_len(&self) -> u64 {
        let mut memo: FnvHashMap<usize, u64> = FnvHashMap::default();
        self.rule_len(START_SLOT, &mut memo)
    }

    // ------------------------------------------------------------------
    // Invariant maintenance
    // ------------------------------------------------------------------

    fn settle(&mut self) {
        while let Some((id, gen)) = self.pending.pop() {
            let node = &self.nodes[id];
            if node.live && node.gen == gen {
                self.check_digram(id);
            }
        }
    }

    fn check_digram(&mut self, id: NodeId) {
        let Some(key) = self.digram_at(id) else {
            return;
        };

        match self.digrams.get(&key).copied() {
            None => {
                self.digrams.insert(key, id);
            }
            Some(other) if other == id => {}
            Some(other) => {
                if !self.nodes[other].live || self.digram_at(other) != Some(key) {
                    self.digrams.insert(key, id);
                    return;
                }
                // Overlapping occurrences cannot both be replaced
                if self.nodes[other].next == Some(id) || self.nodes[id].next == Some(other) {
                    return;
                }
                self.on_match(id, other);
            }
        }
    }

    fn on_match(&mut self, fresh: NodeId, existing: NodeId) {
        if let Some(slot) = self.whole_rule(existing) {
            self.substitute(fresh, slot);
            self.enforce_utility(slot);
            return;
        }
        if let Some(slot) = self.whole_rule(fresh) {
            self.substitute(existing, slot);
            self.enforce_utility(slot);
            return;
        }

        let Some(second) = self.nodes[existing].next else {
            return;
        };
        let first = Symbol {
            value: self.nodes[existing].value,
            exp: self.nodes[existing].exp,
        };
        let second = Symbol {
            value: self.nodes[second].value,
            exp: self.nodes[second].exp,
        };

        let rule_id = self.next_rule_id;
        self.next_rule_id -= 1;
        let slot = self.add_rule(rule_id);

        let a = self.alloc(first.value, first.exp, slot);
        self.insert_between(a, None, None, slot);
        let b = self.alloc(second.value, second.exp, slot);
        self.insert_between(b, Some(a), None, slot);
        self.acquire(first.value, first.exp);
        self.acquire(second.value, second.exp);

        self.substitute(existing, slot);
        self.substitute(fresh, slot);
        self.digrams
            .insert((first.value, first.exp, second.value, second.exp), a);

        self.enforce_utility(slot);
    }

    /// Rule slot whose entire body is the digram starting at `id`
    fn whole_rule(&self, id: NodeId) -> Option<usize> {
        let node = &self.nodes[id];
        if node.rule == START_SLOT || node.next.is_none() {
            return None;
        }
        let rule = &self.rules[node.rule];
        (rule.head == Some(id) && rule.tail == node.next).then_some(node.rule)
    }

    /// Replace the digram starting at `first` with one reference to the rule
    /// in `slot`. Returns the node now holding the reference.
    fn substitute(&mut self, first: NodeId, slot: usize) -> NodeId {
        let Some(second) = self.nodes[first].next else {
            return first;
        };
        let owner = self.nodes[first].rule;
        let before = self.nodes[first].prev;
        let after = self.nodes[second].next;

        self.unindex_opt(before);
        self.unindex(first);
        self.unindex(second);

        let (v1, e1) = (self.nodes[first].value, self.nodes[first].exp);
        let (v2, e2) = (self.nodes[second].value, self.nodes[second].exp);
        self.unlink(first);
        self.unlink(second);
        self.release(first);
        self.release(second);
        self.drop_use(v1, e1);
        self.drop_use(v2, e2);

        let rule_id = self.rules[slot].id;
        let reference = self.alloc(rule_id, 1, owner);
        self.insert_between(reference, before, after, owner);
        self.rules[slot].uses += 1;

        let mut current = reference;
        if let Some(p) = before {
            if self.nodes[p].value == rule_id {
                if let Some(merged) = self.merge_twins(p, reference) {
                    current = merged;
                }
            }
        }
        if let Some(n) = self.nodes[current].next {
            if self.nodes[n].value == rule_id {
                if let Some(merged) = self.merge_twins(current, n) {
                    current = merged;
                }
            }
        }

        let prev = self.nodes[current].prev;
        self.schedule(prev);
        self.schedule(Some(current));
        current
    }

    /// Fold `right` into its left neighbour `left` (same value). Returns
    /// `None` if the combined exponent would overflow.
    fn merge_twins(&mut self, left: NodeId, right: NodeId) -> Option<NodeId> {
        let total = self.nodes[left].exp.checked_add(self.nodes[right].exp)?;
        let before = self.nodes[left].prev;

        self.unindex_opt(before);
        self.unindex(left);
        self.unindex(right);

        self.nodes[left].exp = total;
        self.unlink(right);
        self.release(right);

        self.schedule(before);
        self.schedule(Some(left));
        Some(left)
    }

    /// Inline every single-use rule referenced from the body of `slot`
    fn enforce_utility(&mut self, slot: usize) {
        let mut candidates = Vec::new();
        let mut cursor = self.rules[slot].head;
        while let Some(id) = cursor {
            let node = &self.nodes[id];
            if self.is_single_use_reference(id) {
                candidates.push((id, node.gen));
            }
            cursor = node.next;
        }

        for (id, gen) in candidates {
            let node = &self.nodes[id];
            if node.live && node.gen == gen && self.is_single_use_reference(id) {
                self.inline(id);
            }
        }
    }

    fn is_single_use_reference(&self, id: NodeId) -> bool {
        let node = &self.nodes[id];
        if node.value >= 0 || node.exp != 1 {
            return false;
        }
        self.slot_of
            .get(&node.value)
            .map(|&target| self.rules[target].uses == 1)
            .unwrap_or(false)
    }

    /// Replace the reference at `id` by the body of the rule it names and
    /// delete that rule
    fn inline(&mut self, id: NodeId) {
        let value = self.nodes[id].value;
        let Some(&target) = self.slot_of.get(&value) else {
            return;
        };
        let (Some(head), Some(tail)) = (self.rules[target].head, self.rules[target].tail) else {
            return;
        };

        let owner = self.nodes[id].rule;
        let before = self.nodes[id].prev;
        let after = self.nodes[id].next;

        self.unindex_opt(before);
        self.unindex(id);
        self.unlink(id);
        self.release(id);

        // Body digrams stay indexed: the nodes move, their keys do not change
        let mut cursor = Some(head);
        while let Some(n) = cursor {
            self.nodes[n].rule = owner;
            cursor = self.nodes[n].next;
        }
        self.nodes[head].prev = before;
        match before {
            Some(p) => self.nodes[p].next = Some(head),
            None => self.rules[owner].head = Some(head),
        }
        self.nodes[tail].next = after;
        match after {
            Some(q) => self.nodes[q].prev = Some(tail),
            None => self.rules[owner].tail = Some(tail),
        }

        let retired = &mut self.rules[target];
        retired.head = None;
        retired.tail = None;
        retired.uses = 0;
        retired.live = false;
        self.slot_of.remove(&value);

        let mut last = tail;
        if let Some(p) = before {
            if self.nodes[p].value == self.nodes[head].value {
                if let Some(merged) = self.merge_twins(p, head) {
                    if head == tail {
                        last = merged;
                    }
                }
            }
        }
        if let Some(q) = self.nodes[last].next {
            if self.nodes[q].value == self.nodes[last].value {
                self.merge_twins(last, q);
            }
        }

        self.schedule(before);
        self.schedule(Some(last));
    }

    // ------------------------------------------------------------------
    // Arena plumbing
    // ------------------------------------------------------------------

    fn add_rule(&mut self, id: i32) -> usize {
        let slot = self.rules.len();
        self.rules.push(Rule {
            id,
            head: None,
            tail: None,
            uses: 0,
            live: true,
        });
        self.slot_of.insert(id, slot);
        slot
    }

    fn body(&self, slot: usize) -> Vec<Symbol> {
        let mut symbols = Vec::new();
        let mut cursor = self.rules[slot].head;
        while let Some(id) = cursor {
            let node = &self.nodes[id];
            symbols.push(Symbol {
                value: node.value,
                exp: node.exp,
            });
            cursor = node.next;
        }
        symbols
    }

    fn alloc(&mut self, value: i32, exp: u32, rule: usize) -> NodeId {
        let node = Node {
            value,
            exp,
            prev: None,
            next: None,
            rule,
            gen: 0,
            live: true,
        };
        match self.free.pop() {
            Some(id) => {
                let gen = self.nodes[id].gen;
                self.nodes[id] = Node { gen, ..node };
                id
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, id: NodeId) {
        let node = &mut self.nodes[id];
        node.live = false;
        node.gen = node.gen.wrapping_add(1);
        node.prev = None;
        node.next = None;
        self.free.push(id);
    }

    fn unlink(&mut self, id: NodeId) {
        let (prev, next, slot) = {
            let node = &self.nodes[id];
            (node.prev, node.next, node.rule)
        };
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.rules[slot].head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.rules[slot].tail = prev,
        }
        self.nodes[id].prev = None;
        self.nodes[id].next = None;
    }

    fn insert_between(&mut self, id: NodeId, prev: Option<NodeId>, next: Option<NodeId>, slot: usize) {
        {
            let node = &mut self.nodes[id];
            node.prev = prev;
            node.next = next;
            node.rule = slot;
        }
        match prev {
            Some(p) => self.nodes[p].next = Some(id),
            None => self.rules[slot].head = Some(id),
        }
        match next {
            Some(n) => self.nodes[n].prev = Some(id),
            None => self.rules[slot].tail = Some(id),
        }
    }

    fn acquire(&mut self, value: i32, exp: u32) {
        if value < 0 {
            if let Some(&slot) = self.slot_of.get(&value) {
                self.rules[slot].uses += exp as u64;
            }
        }
    }

    fn drop_use(&mut self, value: i32, exp: u32) {
        if value < 0 {
            if let Some(&slot) = self.slot_of.get(&value) {
                let rule = &mut self.rules[slot];
                rule.uses = rule.uses.saturating_sub(exp as u64);
            }
        }
    }

    fn digram_at(&self, id: NodeId) -> Option<DigramKey> {
        let node = &self.nodes[id];
        let next = &self.nodes[node.next?];
        Some((node.value, node.exp, next.value, next.exp))
    }

    fn unindex(&mut self, id: NodeId) {
        if let Some(key) = self.digram_at(id) {
            if self.digrams.get(&key) == Some(&id) {
                self.digrams.remove(&key);
            }
        }
    }

    fn unindex_opt(&mut self, id: Option<NodeId>) {
        if let Some(id) = id {
            self.unindex(id);
        }
    }

    fn schedule(&mut self, id: Option<NodeId>) {
        if let Some(id) = id {
            let gen = self.nodes[id].gen;
            self.pending.push((id, gen));
        }
    }

    fn rebuild_index(&mut self) {
        self.digrams.clear();
        for rule in self.rules.iter().filter(|r| r.live) {
            let mut cursor = rule.head;
            while let Some(id) = cursor {
                if let Some(key) = self.digram_at(id) {
                    self.digrams.entry(key).or_insert(id);
                }
                cursor = self.nodes[id].next;
            }
        }
    }

    fn ensure_acyclic(&self) -> Result<(), String> {
        // 0 = unvisited, 1 = on stack, 2 = done
        let mut state = vec![0u8; self.rules.len()];
        for root in 0..self.rules.len() {
            if !self.rules[root].live || state[root] != 0 {
                continue;
            }
            let mut stack: Vec<(usize, Option<NodeId>)> = vec![(root, self.rules[root].head)];
            state[root] = 1;
            while let Some(top) = stack.last_mut() {
                let (slot, cursor) = *top;
                match cursor {
                    None => {
                        state[slot] = 2;
                        stack.pop();
                    }
                    Some(id) => {
                        top.1 = self.nodes[id].next;
                        let value = self.nodes[id].value;
                        if value < 0 {
                            let child = self.slot_of[&value];
                            match state[child] {
                                0 => {
                                    state[child] = 1;
                                    stack.push((child, self.rules[child].head));
                                }
                                1 => return Err(format!("rule {} is recursive", value)),
                                _ => {}
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn rule_len(&self, slot: usize, memo: &mut FnvHashMap<usize, u64>) -> u64 {
        if let Some(&len) = memo.get(&slot) {
            return len;
        }
        let mut total: u64 = 0;
        let mut cursor = self.rules[slot].head;
        while let Some(id) = cursor {
            let node = &self.nodes[id];
            let unit = if node.value >= 0 {
                1
            } else {
                match self.slot_of.get(&node.value) {
                    Some(&child) => self.rule_len(child, memo),
                    None => 0,
                }
            };
            total = total.saturating_add(unit.saturating_mul(node.exp as u64));
            cursor = node.next;
        }
        memo.insert(slot, total);
        total
    }
}

struct Frame {
    slot: usize,
    cursor: Option<NodeId>,
    repeats: u32,
}

/// Lazy left-to-right expansion of the start rule into terminals
pub struct Expansion<'a> {
    engine: &'a Engine,
    stack: Vec<Frame>,
    run: Option<(i32, u32)>,
}

impl Iterator for Expansion<'_> {
    type Item = i32;

    fn next(&mut self) -> Option<i32> {
        loop {
            if let Some((terminal, left)) = self.run.as_mut() {
                if *left > 0 {
                    *left -= 1;
                    return Some(*terminal);
                }
                self.run = None;
            }

            let frame = self.stack.last_mut()?;
            match frame.cursor {
                None => {
                    if frame.repeats > 1 {
                        frame.repeats -= 1;
                        frame.cursor = self.engine.rules[frame.slot].head;
                    } else {
                        self.stack.pop();
                    }
                }
                Some(id) => {
                    let node = &self.engine.nodes[id];
                    frame.cursor = node.next;
                    if node.value >= 0 {
                        self.run = Some((node.value, node.exp));
                    } else if let Some(&child) = self.engine.slot_of.get(&node.value) {
                        self.stack.push(Frame {
                            slot: child,
                            cursor: self.engine.rules[child].head,
                            repeats: node.exp,
                        });
                    }
                }
            }
        }
    }
}
