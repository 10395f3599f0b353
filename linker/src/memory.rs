// memory.rs — Variable registry, first-fit allocator, memory model
//
// The registry owns every `Variable`; the allocator's slots hold `VarId`
// handles into it, never the variables themselves. A slot and its occupant
// always agree: `slots[a] == Some(id)` iff `vars[id].address == Some(a)`.
//
// Preconditions: every variable is `register`ed (discovery) before the first
//   `consume` (linking).
// Postconditions: `consume` returns an address in `[0, capacity)` that stays
//   fixed until the variable's uses run out and another variable takes the
//   slot.
// Failure modes: see `LinkError` L02xx/L03xx/L04xx.
// Side effects: `tracing` debug events for every binding and eviction.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::config::HardwareSpec;
use crate::error::{LinkError, Result};
use crate::id::KernelId;
use crate::isa::Address;
use crate::mem_map::{MemoryMap, VarRole};

// ── Variables ────────────────────────────────────────────────────────────

/// Remaining-use count of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UseCount {
    Finite(u32),
    /// Never drains; the variable is never eligible for eviction.
    Persistent,
}

impl UseCount {
    pub fn is_exhausted(self) -> bool {
        self == UseCount::Finite(0)
    }

    fn increment(&mut self) {
        if let UseCount::Finite(n) = self {
            *n += 1;
        }
    }
}

/// Per-variable bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub address: Option<Address>,
    pub uses: UseCount,
    /// Kernel of the most recent `consume`; `None` before the first one,
    /// which orders before every kernel.
    pub last_kernel_used: Option<KernelId>,
}

impl Variable {
    fn new(name: &str) -> Self {
        Variable {
            name: name.to_string(),
            address: None,
            uses: UseCount::Finite(0),
            last_kernel_used: None,
        }
    }
}

/// Handle into the variable registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId(u32);

impl VarId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

// ── Allocator ────────────────────────────────────────────────────────────

/// When an occupied slot may be handed to another variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionRule {
    /// HBM present: the occupant has no uses left and its last access was in
    /// an earlier kernel than the incoming variable's current one.
    AfterLastUse,
    /// Scratchpad only: the occupant has no uses left. Recency is ignored.
    UsesExhausted,
}

impl EvictionRule {
    pub fn for_spec(spec: &HardwareSpec) -> Self {
        if spec.has_hbm {
            EvictionRule::AfterLastUse
        } else {
            EvictionRule::UsesExhausted
        }
    }

    pub fn allows(self, occupant: &Variable, incoming: &Variable) -> bool {
        if !occupant.uses.is_exhausted() {
            return false;
        }
        match self {
            EvictionRule::AfterLastUse => occupant.last_kernel_used < incoming.last_kernel_used,
            EvictionRule::UsesExhausted => true,
        }
    }
}

/// Fixed-capacity array of slot bindings with first-fit allocation.
#[derive(Debug, Clone)]
pub struct HbmAllocator {
    slots: Vec<Option<VarId>>,
    rule: EvictionRule,
}

impl HbmAllocator {
    pub fn new(capacity: usize, rule: EvictionRule) -> Self {
        HbmAllocator {
            slots: vec![None; capacity],
            rule,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn rule(&self) -> EvictionRule {
        self.rule
    }

    pub fn occupant(&self, address: Address) -> Option<VarId> {
        self.slots.get(address as usize).copied().flatten()
    }

    /// Number of slots currently holding a variable.
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Bind `id` to `address`. A no-op when it is already bound there.
    pub fn force_allocate(
        &mut self,
        vars: &mut [Variable],
        id: VarId,
        address: Address,
    ) -> Result<()> {
        let capacity = self.capacity();
        let var = &vars[id.index()];
        if address as usize >= capacity {
            return Err(LinkError::AddressOutOfRange {
                name: var.name.clone(),
                address,
                capacity,
            });
        }
        match var.address {
            Some(bound) if bound == address => return Ok(()),
            Some(bound) => {
                return Err(LinkError::AlreadyBound {
                    name: var.name.clone(),
                    bound,
                    requested: address,
                })
            }
            None => {}
        }

        if let Some(occ) = self.slots[address as usize] {
            let occupant = &vars[occ.index()];
            if !self.rule.allows(occupant, var) {
                return Err(LinkError::SlotOccupied {
                    address,
                    occupant: occupant.name.clone(),
                    name: var.name.clone(),
                });
            }
            debug!(
                evicted = %occupant.name,
                variable = %var.name,
                address,
                "slot recycled"
            );
            vars[occ.index()].address = None;
        }

        self.slots[address as usize] = Some(id);
        vars[id.index()].address = Some(address);
        Ok(())
    }

    /// Bind `id` to the lowest slot that is empty or whose occupant may be
    /// evicted.
    pub fn allocate(
        &mut self,
        vars: &mut [Variable],
        id: VarId,
        kernel: KernelId,
    ) -> Result<Address> {
        let incoming = &vars[id.index()];
        let free = self.slots.iter().position(|slot| match slot {
            None => true,
            Some(occ) => self.rule.allows(&vars[occ.index()], incoming),
        });
        let Some(address) = free else {
            return Err(LinkError::AllocationExhausted {
                name: incoming.name.clone(),
                capacity: self.capacity(),
                kernel,
            });
        };
        let address = address as Address;
        self.force_allocate(vars, id, address)?;
        debug!(variable = %vars[id.index()].name, address, %kernel, "allocated");
        Ok(address)
    }
}

// ── Memory model ─────────────────────────────────────────────────────────

/// Registry plus allocator for one link session.
#[derive(Debug)]
pub struct MemoryModel {
    spec: HardwareSpec,
    declared: MemoryMap,
    vars: Vec<Variable>,
    index: HashMap<String, VarId>,
    hbm: HbmAllocator,
}

impl MemoryModel {
    pub fn new(spec: HardwareSpec, declared: MemoryMap) -> Result<Self> {
        spec.validate()?;
        Ok(MemoryModel {
            hbm: HbmAllocator::new(spec.memory_capacity(), EvictionRule::for_spec(&spec)),
            spec,
            declared,
            vars: Vec::new(),
            index: HashMap::new(),
        })
    }

    pub fn spec(&self) -> &HardwareSpec {
        &self.spec
    }

    pub fn memory_map(&self) -> &MemoryMap {
        &self.declared
    }

    pub fn allocator(&self) -> &HbmAllocator {
        &self.hbm
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.index.get(name).map(|id| &self.vars[id.index()])
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.vars.iter()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Fixed address from the memory map, if `name` is declared there.
    pub fn declared_address(&self, name: &str) -> Option<Address> {
        self.declared.address_of(name)
    }

    /// Record one occurrence of `name`.
    ///
    /// The first call creates the variable. A declared variable is bound to
    /// its fixed address right away: inputs with a finite count so their
    /// slot can be recycled after the last reader, outputs and metadata as
    /// persistent. Every call adds one use.
    pub fn register(&mut self, name: &str) -> Result<()> {
        let id = match self.index.get(name) {
            Some(&id) => id,
            None => {
                let id = VarId(self.vars.len() as u32);
                let mut var = Variable::new(name);
                let fixed = self.declared.get(name).map(|d| (d.address, d.role));
                if let Some((_, role)) = fixed {
                    if role.is_persistent() {
                        var.uses = UseCount::Persistent;
                    }
                }
                self.vars.push(var);
                self.index.insert(name.to_string(), id);
                if let Some((address, role)) = fixed {
                    self.hbm.force_allocate(&mut self.vars, id, address)?;
                    debug!(variable = name, address, %role, "bound declared variable");
                }
                id
            }
        };
        self.vars[id.index()].uses.increment();
        trace!(variable = name, uses = ?self.vars[id.index()].uses, "registered");
        Ok(())
    }

    /// Resolve one occurrence of `name` in `kernel`, allocating on first use.
    pub fn consume(&mut self, name: &str, kernel: KernelId) -> Result<Address> {
        let Some(&id) = self.index.get(name) else {
            return Err(LinkError::UnregisteredVariable {
                name: name.to_string(),
                kernel,
            });
        };
        let var = &mut self.vars[id.index()];
        match &mut var.uses {
            UseCount::Finite(0) => {
                return Err(LinkError::UsesExhausted {
                    name: name.to_string(),
                    kernel,
                })
            }
            UseCount::Finite(n) => *n -= 1,
            UseCount::Persistent => {}
        }
        var.last_kernel_used = Some(kernel);
        let bound = var.address;

        let address = match bound {
            Some(address) => address,
            None => self.hbm.allocate(&mut self.vars, id, kernel)?,
        };
        debug_assert_eq!(self.hbm.occupant(address), Some(id));
        Ok(address)
    }

    /// Every declared input, output and metadata variable must have been
    /// registered by some kernel. Without HBM, metadata is exempt.
    pub fn check_declared_variables_used(&self) -> Result<()> {
        for decl in self.declared.declarations() {
            if self.index.contains_key(&decl.name) {
                continue;
            }
            if !self.spec.has_hbm && matches!(decl.role, VarRole::Metadata(_)) {
                continue;
            }
            return Err(LinkError::MissingFixedVariable {
                name: decl.name.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{codes, ErrorKind};

    fn model(capacity: usize, mem: &str) -> MemoryModel {
        let map = MemoryMap::parse(mem, "test.mem").unwrap();
        MemoryModel::new(HardwareSpec::with_hbm(capacity), map).unwrap()
    }

    fn spad_model(capacity: usize, mem: &str) -> MemoryModel {
        let map = MemoryMap::parse(mem, "test.mem").unwrap();
        MemoryModel::new(HardwareSpec::without_hbm(capacity), map).unwrap()
    }

    // ── Allocator ──

    fn var(name: &str, uses: u32, last: Option<u32>) -> Variable {
        Variable {
            name: name.to_string(),
            address: None,
            uses: UseCount::Finite(uses),
            last_kernel_used: last.map(KernelId),
        }
    }

    #[test]
    fn force_allocate_is_idempotent() {
        let mut vars = vec![var("a", 1, None)];
        let mut hbm = HbmAllocator::new(4, EvictionRule::AfterLastUse);
        hbm.force_allocate(&mut vars, VarId(0), 2).unwrap();
        hbm.force_allocate(&mut vars, VarId(0), 2).unwrap();
        assert_eq!(vars[0].address, Some(2));
        assert_eq!(hbm.occupied(), 1);
    }

    #[test]
    fn force_allocate_rejects_rebinding() {
        let mut vars = vec![var("a", 1, None)];
        let mut hbm = HbmAllocator::new(4, EvictionRule::AfterLastUse);
        hbm.force_allocate(&mut vars, VarId(0), 2).unwrap();
        let err = hbm.force_allocate(&mut vars, VarId(0), 3).unwrap_err();
        assert_eq!(err.code(), codes::L0302);
    }

    #[test]
    fn force_allocate_rejects_out_of_range() {
        let mut vars = vec![var("a", 1, None)];
        let mut hbm = HbmAllocator::new(4, EvictionRule::AfterLastUse);
        let err = hbm.force_allocate(&mut vars, VarId(0), 4).unwrap_err();
        assert_eq!(err.code(), codes::L0301);
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }

    #[test]
    fn live_occupant_blocks_slot() {
        let mut vars = vec![var("a", 1, Some(0)), var("b", 1, Some(1))];
        let mut hbm = HbmAllocator::new(2, EvictionRule::UsesExhausted);
        hbm.force_allocate(&mut vars, VarId(0), 0).unwrap();
        let err = hbm.force_allocate(&mut vars, VarId(1), 0).unwrap_err();
        assert_eq!(err.code(), codes::L0303);
    }

    #[test]
    fn hbm_rule_requires_earlier_kernel() {
        let occupant = var("a", 0, Some(3));
        assert!(!EvictionRule::AfterLastUse.allows(&occupant, &var("b", 1, Some(3))));
        assert!(EvictionRule::AfterLastUse.allows(&occupant, &var("b", 1, Some(4))));
        // the scratchpad rule ignores recency
        assert!(EvictionRule::UsesExhausted.allows(&occupant, &var("b", 1, Some(3))));
    }

    #[test]
    fn eviction_unbinds_previous_occupant() {
        let mut vars = vec![var("a", 0, Some(0)), var("b", 1, Some(1))];
        let mut hbm = HbmAllocator::new(1, EvictionRule::AfterLastUse);
        hbm.force_allocate(&mut vars, VarId(0), 0).unwrap();
        let addr = hbm.allocate(&mut vars, VarId(1), KernelId(1)).unwrap();
        assert_eq!(addr, 0);
        assert_eq!(vars[0].address, None);
        assert_eq!(hbm.occupant(0), Some(VarId(1)));
    }

    // ── Memory model ──

    #[test]
    fn first_fit_in_registration_order() {
        let mut m = model(4, "");
        for name in ["a", "b", "c"] {
            m.register(name).unwrap();
        }
        assert_eq!(m.consume("b", KernelId(0)).unwrap(), 0);
        assert_eq!(m.consume("a", KernelId(0)).unwrap(), 1);
        assert_eq!(m.consume("c", KernelId(0)).unwrap(), 2);
    }

    #[test]
    fn address_is_stable_across_uses() {
        let mut m = model(4, "");
        m.register("x").unwrap();
        m.register("x").unwrap();
        m.register("x").unwrap();
        let first = m.consume("x", KernelId(0)).unwrap();
        assert_eq!(m.consume("x", KernelId(1)).unwrap(), first);
        assert_eq!(m.consume("x", KernelId(2)).unwrap(), first);
        let err = m.consume("x", KernelId(3)).unwrap_err();
        assert_eq!(err.code(), codes::L0401);
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn slot_reused_only_in_later_kernel_with_hbm() {
        let mut m = model(1, "");
        m.register("a").unwrap();
        m.register("b").unwrap();
        assert_eq!(m.consume("a", KernelId(0)).unwrap(), 0);
        // same kernel: `a` was last used in kernel 0, not before it
        let err = m.consume("b", KernelId(0)).unwrap_err();
        assert_eq!(err.code(), codes::L0201);
    }

    #[test]
    fn slot_reused_in_next_kernel_with_hbm() {
        let mut m = model(1, "");
        m.register("a").unwrap();
        m.register("b").unwrap();
        assert_eq!(m.consume("a", KernelId(0)).unwrap(), 0);
        assert_eq!(m.consume("b", KernelId(1)).unwrap(), 0);
        assert_eq!(m.variable("a").unwrap().address, None);
    }

    #[test]
    fn slot_reused_in_same_kernel_without_hbm() {
        let mut m = spad_model(1, "");
        m.register("a").unwrap();
        m.register("b").unwrap();
        assert_eq!(m.consume("a", KernelId(0)).unwrap(), 0);
        assert_eq!(m.consume("b", KernelId(0)).unwrap(), 0);
    }

    #[test]
    fn declared_variables_bind_at_registration() {
        let mut m = model(8, "dload, poly, 5, ct_in\ndstore, ct_out, 6\n");
        m.register("ct_in").unwrap();
        m.register("ct_out").unwrap();
        let input = m.variable("ct_in").unwrap();
        assert_eq!(input.address, Some(5));
        assert_eq!(input.uses, UseCount::Finite(1));
        assert_eq!(m.variable("ct_out").unwrap().uses, UseCount::Persistent);
        assert_eq!(m.consume("ct_out", KernelId(0)).unwrap(), 6);
        assert_eq!(m.consume("ct_out", KernelId(1)).unwrap(), 6);
    }

    #[test]
    fn declared_input_is_recycled_after_last_use() {
        let mut m = model(1, "dload, poly, 0, ct_in\n");
        m.register("ct_in").unwrap();
        m.register("tmp").unwrap();
        assert_eq!(m.consume("ct_in", KernelId(0)).unwrap(), 0);
        assert_eq!(m.consume("tmp", KernelId(1)).unwrap(), 0);
    }

    #[test]
    fn persistent_variables_are_never_evicted() {
        let mut m = model(1, "dstore, ct_out, 0\n");
        m.register("ct_out").unwrap();
        m.register("tmp").unwrap();
        m.consume("ct_out", KernelId(0)).unwrap();
        let err = m.consume("tmp", KernelId(5)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AllocationExhausted);
    }

    #[test]
    fn declared_address_out_of_range_is_fatal() {
        let mut m = model(2, "dstore, ct_out, 9\n");
        let err = m.register("ct_out").unwrap_err();
        assert_eq!(err.code(), codes::L0301);
    }

    #[test]
    fn unregistered_consume_is_fatal() {
        let mut m = model(2, "");
        let err = m.consume("ghost", KernelId(0)).unwrap_err();
        assert_eq!(err.code(), codes::L0402);
    }

    #[test]
    fn unused_declarations_are_reported() {
        let mut m = model(4, "dload, poly, 0, a\ndload, ones, 1\n");
        m.register("a").unwrap();
        let err = m.check_declared_variables_used().unwrap_err();
        assert!(err.to_string().contains("ones_1"), "{err}");
    }

    #[test]
    fn metadata_is_exempt_without_hbm() {
        let mut m = spad_model(4, "dload, poly, 0, a\ndload, ones, 1\n");
        m.register("a").unwrap();
        m.check_declared_variables_used().unwrap();
    }

    #[test]
    fn zero_capacity_spec_is_rejected() {
        let err = MemoryModel::new(HardwareSpec::with_hbm(0), MemoryMap::new()).unwrap_err();
        assert_eq!(err.code(), codes::L0104);
    }
}
