//! Variable store: reference-counted IR nodes, dependency edges, and the
//! common subexpression elimination cache.

use crate::backend::{Data, JitBackend};
use crate::hash::Map;
use crate::dtype::VarType;
use crate::error::{jit_fail, JitError};
use crate::log::jit_log;
use crate::op::Op;

/// Variable identifier. Monotone within a process, 0 encodes absence.
pub type VarId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    /// Compile-time constant, payload in `literal`
    Literal,
    /// Evaluated buffer, `data` is set and `deps` are empty
    Data,
    /// Pending operation
    Node(Op),
}

#[derive(Debug)]
pub struct Variable {
    pub kind: VarKind,
    pub backend: JitBackend,
    pub vt: VarType,
    /// Logical number of elements. Broadcasting scalars have size 1.
    pub size: u32,
    /// Input variable ids, 0 encodes absence
    pub deps: [VarId; 4],
    /// References from other variables' `deps` (counting multiplicity)
    pub ref_count_int: u32,
    /// References from user-facing handles
    pub ref_count_ext: u32,
    /// Literal payload (bit pattern of the constant)
    pub literal: u64,
    /// Backend buffer once evaluated
    pub data: Option<Data>,
    /// Writes to memory; ordered, never CSE'd
    pub scatter: bool,
    /// Data variable with not-yet-materialized scatters targeting it
    pub dirty: bool,
    /// Entry in the `extra` side table exists
    pub extra: bool,
}

impl Variable {
    pub fn is_data(&self) -> bool {
        matches!(self.kind, VarKind::Data)
    }

    pub fn is_literal(&self) -> bool {
        matches!(self.kind, VarKind::Literal)
    }

    pub fn is_node(&self) -> bool {
        matches!(self.kind, VarKind::Node(_))
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn ref_sum(&self) -> u64 {
        u64::from(self.ref_count_int) + u64::from(self.ref_count_ext)
    }
}

/// Side table entry for large or rare variable attributes.
#[derive(Default)]
pub struct Extra {
    /// Descriptive label shown in log output
    pub label: Option<Box<str>>,
    /// Invoked once when the variable is collected
    pub free_callback: Option<Box<dyn Fn(VarId) + Send>>,
    /// Callback may be invoked while the global lock is held
    pub callback_internal: bool,
}

impl std::fmt::Debug for Extra {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extra")
            .field("label", &self.label)
            .field("callback", &self.free_callback.is_some())
            .finish()
    }
}

/// Key identifying a structurally equivalent pure operation. Exactly
/// eight 32-bit words; layout is frozen because the key is hashed and
/// compared bit for bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct CseKey {
    pub op: u32,
    pub vt: u32,
    pub size: u32,
    pub deps: [VarId; 4],
    pub backend: u32,
}

const _: () = assert!(std::mem::size_of::<CseKey>() == 8 * std::mem::size_of::<u32>());

impl CseKey {
    fn new(op: Op, vt: VarType, size: u32, deps: [VarId; 4], backend: JitBackend) -> CseKey {
        CseKey { op: op as u32, vt: vt as u32, size, deps, backend: backend as u32 }
    }

    fn of(v: &Variable) -> Option<CseKey> {
        match v.kind {
            VarKind::Node(op) if !v.scatter => {
                Some(CseKey::new(op, v.vt, v.size, v.deps, v.backend))
            }
            _ => None,
        }
    }
}

/// Result of a collection pass: buffers and side-table callbacks that must
/// be processed by the caller (buffers may wait on stream completion, and
/// external callbacks run with the global lock released).
#[derive(Default)]
pub struct Collected {
    pub buffers: Vec<Data>,
    pub callbacks: Vec<(VarId, Box<dyn Fn(VarId) + Send>)>,
}

/// The IR graph. Owned by the global state record; all mutation happens
/// under its mutex.
pub struct VarStore {
    variables: Map<VarId, Variable>,
    cse: Map<CseKey, VarId>,
    extra: Map<VarId, Extra>,
    variable_index: VarId,
    /// High-water mark of the variable map, for shutdown diagnostics
    watermark: usize,
}

impl VarStore {
    pub fn new() -> VarStore {
        VarStore {
            variables: Map::default(),
            cse: Map::default(),
            extra: Map::default(),
            variable_index: 1,
            watermark: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn cse_len(&self) -> usize {
        self.cse.len()
    }

    pub fn extra_len(&self) -> usize {
        self.extra.len()
    }

    pub fn watermark(&self) -> usize {
        self.watermark
    }

    pub fn contains(&self, id: VarId) -> bool {
        self.variables.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (VarId, &Variable)> {
        self.variables.iter().map(|(id, v)| (*id, v))
    }

    /// Access a variable, terminating on an unknown id. Internal callers
    /// pass ids whose liveness they already guarantee.
    pub fn var(&self, id: VarId) -> &Variable {
        match self.variables.get(&id) {
            Some(v) => v,
            None => jit_fail!("r{id}: unknown variable"),
        }
    }

    pub fn var_mut(&mut self, id: VarId) -> &mut Variable {
        match self.variables.get_mut(&id) {
            Some(v) => v,
            None => jit_fail!("r{id}: unknown variable"),
        }
    }

    /// Checked lookup for ids arriving from the public API.
    pub fn get(&self, id: VarId) -> Result<&Variable, JitError> {
        self.variables.get(&id).ok_or(JitError::InvalidHandle(id))
    }

    pub fn extra(&mut self, id: VarId) -> &mut Extra {
        self.var_mut(id).extra = true;
        self.extra.entry(id).or_default()
    }

    pub fn label(&self, id: VarId) -> Option<&str> {
        self.extra.get(&id).and_then(|e| e.label.as_deref())
    }

    /// Insert a fresh variable, returning its id with one external reference.
    fn insert(&mut self, v: Variable) -> VarId {
        let id = self.variable_index;
        self.variable_index = match self.variable_index.checked_add(1) {
            Some(n) => n,
            None => jit_fail!("variable index overflow (2^32 variables created)"),
        };
        let old = self.variables.insert(id, v);
        debug_assert!(old.is_none());
        self.watermark = self.watermark.max(self.variables.len());
        id
    }

    /// Create a literal constant.
    pub fn new_literal(&mut self, backend: JitBackend, vt: VarType, bits: u64, size: u32) -> VarId {
        let v = Variable {
            kind: VarKind::Literal,
            backend,
            vt,
            size,
            deps: [0; 4],
            ref_count_int: 0,
            ref_count_ext: 1,
            literal: bits,
            data: None,
            scatter: false,
            dirty: false,
            extra: false,
        };
        let id = self.insert(v);
        jit_log!(Trace, "var", "new_literal({vt} r{id}[{size}])");
        id
    }

    /// Register an evaluated buffer as a variable (invariant: no deps).
    pub fn new_data(
        &mut self,
        backend: JitBackend,
        vt: VarType,
        size: u32,
        data: Data,
    ) -> VarId {
        let v = Variable {
            kind: VarKind::Data,
            backend,
            vt,
            size,
            deps: [0; 4],
            ref_count_int: 0,
            ref_count_ext: 1,
            literal: 0,
            data: Some(data),
            scatter: false,
            dirty: false,
            extra: false,
        };
        let id = self.insert(v);
        jit_log!(Trace, "var", "new_data({vt} r{id}[{size}])");
        id
    }

    /// Create an op node. Pure ops are routed through the CSE cache; a hit
    /// increments the existing id's external count and returns it without
    /// creating anything. Deps must be clean (no pending side effects);
    /// the caller flushes dirty operands beforehand.
    pub fn new_op(
        &mut self,
        backend: JitBackend,
        op: Op,
        vt: VarType,
        deps: [VarId; 4],
    ) -> Result<VarId, JitError> {
        let arity = op.arity();

        // Broadcast rule: output covers the largest operand, scalars stretch
        let mut size = if arity == 0 { 1 } else { 0 };
        for &dep in &deps[..arity] {
            if dep == 0 {
                continue;
            }
            let ds = self.get(dep)?.size;
            size = size.max(ds);
        }
        for &dep in &deps[..arity] {
            if dep == 0 {
                continue;
            }
            let ds = self.get(dep)?.size;
            if ds != size && ds != 1 {
                return Err(JitError::SizeMismatch(
                    format!("operand r{dep} has size {ds}, operation has size {size}").into(),
                ));
            }
        }
        if size == 0 {
            return Err(JitError::InvalidHandle(0));
        }

        let scatter = op.is_side_effect();
        if !scatter {
            let key = CseKey::new(op, vt, size, deps, backend);
            if let Some(&hit) = self.cse.get(&key) {
                self.var_mut(hit).ref_count_ext += 1;
                jit_log!(Trace, "var", "new_op({op} r{hit}): cse hit");
                return Ok(hit);
            }
        }

        for &dep in &deps[..arity] {
            if dep != 0 {
                self.var_mut(dep).ref_count_int += 1;
            }
        }

        let v = Variable {
            kind: VarKind::Node(op),
            backend,
            vt,
            size,
            deps,
            ref_count_int: 0,
            ref_count_ext: 1,
            literal: 0,
            data: None,
            scatter,
            dirty: false,
            extra: false,
        };
        let id = self.insert(v);
        if !scatter {
            self.cse.insert(CseKey::new(op, vt, size, deps, backend), id);
        }

        if crate::log::max_level() >= crate::log::LogLevel::Debug {
            let mut msg = format!("new_op({} {} r{id}[{size}]", op, vt);
            let n_dep = deps[..arity].iter().filter(|&&d| d != 0).count();
            if n_dep > 0 {
                msg.push_str(" <- ");
                for (i, d) in deps[..arity].iter().filter(|&&d| d != 0).enumerate() {
                    if i > 0 {
                        msg.push_str(", ");
                    }
                    msg.push_str(&format!("r{d}"));
                }
            }
            msg.push(')');
            jit_log!(Debug, "var", "{msg}");
        }
        Ok(id)
    }

    /// Lane counter 0..size. The only op whose size is not derived from
    /// its inputs.
    pub fn new_counter(&mut self, backend: JitBackend, size: u32) -> VarId {
        let key = CseKey::new(Op::Counter, VarType::U32, size, [0; 4], backend);
        if let Some(&hit) = self.cse.get(&key) {
            self.var_mut(hit).ref_count_ext += 1;
            return hit;
        }
        let v = Variable {
            kind: VarKind::Node(Op::Counter),
            backend,
            vt: VarType::U32,
            size,
            deps: [0; 4],
            ref_count_int: 0,
            ref_count_ext: 1,
            literal: 0,
            data: None,
            scatter: false,
            dirty: false,
            extra: false,
        };
        let id = self.insert(v);
        self.cse.insert(key, id);
        id
    }

    /// Indexed read. The output covers the index (and mask), not the
    /// source buffer, so sizing skips the first dependency.
    pub fn new_gather(
        &mut self,
        source: VarId,
        index: VarId,
        mask: VarId,
    ) -> Result<VarId, JitError> {
        let src = self.get(source)?;
        debug_assert!(src.is_data());
        let vt = src.vt;
        let backend = src.backend;
        let size = self.memory_op_size(&[index, mask])?;

        let deps = [source, index, mask, 0];
        let key = CseKey::new(Op::Gather, vt, size, deps, backend);
        if let Some(&hit) = self.cse.get(&key) {
            self.var_mut(hit).ref_count_ext += 1;
            return Ok(hit);
        }
        for dep in deps {
            if dep != 0 {
                self.var_mut(dep).ref_count_int += 1;
            }
        }
        let v = Variable {
            kind: VarKind::Node(Op::Gather),
            backend,
            vt,
            size,
            deps,
            ref_count_int: 0,
            ref_count_ext: 1,
            literal: 0,
            data: None,
            scatter: false,
            dirty: false,
            extra: false,
        };
        let id = self.insert(v);
        self.cse.insert(key, id);
        jit_log!(Debug, "var", "new_gather(r{id}[{size}] <- r{source}, r{index})");
        Ok(id)
    }

    /// Indexed write to `target`'s buffer. Never CSE'd; participates in
    /// evaluation ordering through the dirty flag on the target.
    pub fn new_scatter(
        &mut self,
        target: VarId,
        index: VarId,
        value: VarId,
        mask: VarId,
    ) -> Result<VarId, JitError> {
        let tgt = self.get(target)?;
        debug_assert!(tgt.is_data());
        let backend = tgt.backend;
        let vt = self.get(value)?.vt;
        let size = self.memory_op_size(&[index, value, mask])?;

        let deps = [target, index, value, mask];
        for dep in deps {
            if dep != 0 {
                self.var_mut(dep).ref_count_int += 1;
            }
        }
        let v = Variable {
            kind: VarKind::Node(Op::Scatter),
            backend,
            vt,
            size,
            deps,
            ref_count_int: 0,
            ref_count_ext: 1,
            literal: 0,
            data: None,
            scatter: true,
            dirty: false,
            extra: false,
        };
        let id = self.insert(v);
        self.mark_dirty(target);
        jit_log!(Debug, "var", "new_scatter(r{id}[{size}] -> r{target}[r{index}])");
        Ok(id)
    }

    /// Alias of a scalar at a different size; deps of size 1 broadcast,
    /// so the alias is a plain width-changing bitcast node.
    pub fn new_broadcast(&mut self, dep: VarId, size: u32) -> Result<VarId, JitError> {
        let v = self.get(dep)?;
        let (backend, vt) = (v.backend, v.vt);
        let deps = [dep, 0, 0, 0];
        let key = CseKey::new(Op::Bitcast, vt, size, deps, backend);
        if let Some(&hit) = self.cse.get(&key) {
            self.var_mut(hit).ref_count_ext += 1;
            return Ok(hit);
        }
        self.var_mut(dep).ref_count_int += 1;
        let v = Variable {
            kind: VarKind::Node(Op::Bitcast),
            backend,
            vt,
            size,
            deps,
            ref_count_int: 0,
            ref_count_ext: 1,
            literal: 0,
            data: None,
            scatter: false,
            dirty: false,
            extra: false,
        };
        let id = self.insert(v);
        self.cse.insert(key, id);
        Ok(id)
    }

    /// Broadcast sizing over the non-buffer operands of a memory op.
    fn memory_op_size(&self, deps: &[VarId]) -> Result<u32, JitError> {
        let mut size = 0;
        for &dep in deps {
            if dep == 0 {
                continue;
            }
            size = size.max(self.get(dep)?.size);
        }
        for &dep in deps {
            if dep == 0 {
                continue;
            }
            let ds = self.get(dep)?.size;
            if ds != size && ds != 1 {
                return Err(JitError::SizeMismatch(
                    format!("operand r{dep} has size {ds}, operation has size {size}").into(),
                ));
            }
        }
        if size == 0 {
            return Err(JitError::InvalidHandle(0));
        }
        Ok(size)
    }

    pub fn inc_ref_ext(&mut self, id: VarId) {
        if id == 0 {
            return;
        }
        let v = self.var_mut(id);
        v.ref_count_ext += 1;
    }

    /// Drop one external reference; collect eagerly once the sum hits zero.
    pub fn dec_ref_ext(&mut self, id: VarId, out: &mut Collected) {
        if id == 0 {
            return;
        }
        let v = self.var_mut(id);
        if v.ref_count_ext == 0 {
            jit_fail!("dec_ref_ext(r{id}): no external references remain");
        }
        v.ref_count_ext -= 1;
        if v.ref_sum() == 0 {
            self.free(id, out);
        }
    }

    pub fn inc_ref_int(&mut self, id: VarId) {
        if id == 0 {
            return;
        }
        self.var_mut(id).ref_count_int += 1;
    }

    pub fn dec_ref_int(&mut self, id: VarId, out: &mut Collected) {
        if id == 0 {
            return;
        }
        let v = self.var_mut(id);
        if v.ref_count_int == 0 {
            jit_fail!("dec_ref_int(r{id}): no internal references remain");
        }
        v.ref_count_int -= 1;
        if v.ref_sum() == 0 {
            self.free(id, out);
        }
    }

    /// Scatter targets carry pending writes that force evaluation ordering.
    pub fn mark_dirty(&mut self, id: VarId) {
        self.var_mut(id).dirty = true;
    }

    /// Collect `root` and everything its death unreferences. Runs on an
    /// explicit worklist: graphs exceed 10^6 nodes and recursion would
    /// exhaust the stack.
    fn free(&mut self, root: VarId, out: &mut Collected) {
        let mut worklist = vec![root];
        while let Some(id) = worklist.pop() {
            let mut v = match self.variables.remove(&id) {
                Some(v) => v,
                None => jit_fail!("free(r{id}): unknown variable"),
            };
            jit_log!(Trace, "var", "free(r{id})");

            if let Some(key) = CseKey::of(&v) {
                // Only purge the entry if it still points at this id
                if self.cse.get(&key) == Some(&id) {
                    self.cse.remove(&key);
                }
            }

            if let Some(data) = v.data.take() {
                out.buffers.push(data);
            }

            if v.extra {
                if let Some(extra) = self.extra.remove(&id) {
                    if let Some(cb) = extra.free_callback {
                        out.callbacks.push((id, cb));
                    }
                }
            }

            for &dep in &v.deps {
                if dep == 0 {
                    continue;
                }
                let d = self.var_mut(dep);
                if d.ref_count_int == 0 {
                    jit_fail!("free(r{id}): dependency r{dep} has no internal references");
                }
                d.ref_count_int -= 1;
                if d.ref_sum() == 0 {
                    worklist.push(dep);
                }
            }
        }
    }

    /// Flip an evaluated node into data form: record the buffer, then drop
    /// the incoming edges (an evaluated buffer has none).
    pub fn set_evaluated(&mut self, id: VarId, data: Data, out: &mut Collected) {
        // The node leaves the expression world; its CSE entry must not
        // resolve future lookups to a buffer.
        if let Some(key) = CseKey::of(self.var(id)) {
            if self.cse.get(&key) == Some(&id) {
                self.cse.remove(&key);
            }
        }

        let v = self.var_mut(id);
        debug_assert!(!v.scatter);
        v.kind = VarKind::Data;
        v.data = Some(data);
        v.dirty = false;
        let deps = std::mem::replace(&mut v.deps, [0; 4]);

        for dep in deps {
            if dep != 0 {
                self.dec_ref_int(dep, out);
            }
        }
    }

    /// A launched scatter has delivered its write; release its operands so
    /// the kernel's inputs do not stay alive through the husk of the node.
    pub fn set_executed(&mut self, id: VarId, out: &mut Collected) {
        let v = self.var_mut(id);
        debug_assert!(v.scatter);
        let deps = std::mem::replace(&mut v.deps, [0; 4]);
        for dep in deps {
            if dep != 0 {
                self.dec_ref_int(dep, out);
            }
        }
    }

    /// Debug dump of one variable, sized for log output.
    pub fn var_summary(&self, id: VarId) -> String {
        let v = self.var(id);
        let what = match v.kind {
            VarKind::Literal => {
                format!("literal {}", crate::dtype::literal_to_string(v.literal, v.vt))
            }
            VarKind::Data => "data".into(),
            VarKind::Node(op) => format!("{op}"),
        };
        format!(
            "r{id}[{}] = {what} ({}, int={}, ext={})",
            v.size, v.vt, v.ref_count_int, v.ref_count_ext
        )
    }
}
