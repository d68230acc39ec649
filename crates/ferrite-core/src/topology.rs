//! Global unknown numbering.
//!
//! Devices register the node voltages and branch currents they touch while the
//! topology is open. Once [`Topology::finalize`] is called the numbering is frozen
//! and every vector in the analysis shares that index space.

use indexmap::IndexMap;

use crate::error::{Error, Result};

/// Index of a global unknown (node voltage or branch current).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(usize);

impl VarId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

/// What a global unknown represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    /// Node voltage.
    Node,
    /// Branch current owned by a device (voltage sources, inductors, VCVS).
    Branch,
}

/// First entry of a contiguous block of device state slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSlot(usize);

impl StateSlot {
    /// Index of the `offset`-th slot in the block.
    pub fn at(self, offset: usize) -> usize {
        self.0 + offset
    }
}

/// First entry of a contiguous block of device store (output) slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreSlot(usize);

impl StoreSlot {
    pub fn at(self, offset: usize) -> usize {
        self.0 + offset
    }
}

/// Global numbering of unknowns, states and stores.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    vars: IndexMap<String, VarKind>,
    num_states: usize,
    num_stores: usize,
    finalized: bool,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a node name denotes the ground reference.
    pub fn is_ground(name: &str) -> bool {
        name == "0" || name.eq_ignore_ascii_case("gnd")
    }

    /// Look up or create the unknown for a node voltage.
    ///
    /// Returns `None` for ground, which has no unknown.
    pub fn node(&mut self, name: &str) -> Result<Option<VarId>> {
        if Self::is_ground(name) {
            return Ok(None);
        }
        if let Some((index, _, kind)) = self.vars.get_full(name) {
            return match kind {
                VarKind::Node => Ok(Some(VarId(index))),
                VarKind::Branch => Err(Error::DuplicateUnknown(name.to_string())),
            };
        }
        self.check_open()?;
        let (index, _) = self.vars.insert_full(name.to_string(), VarKind::Node);
        Ok(Some(VarId(index)))
    }

    /// Create the branch-current unknown owned by `device`.
    pub fn branch(&mut self, device: &str) -> Result<VarId> {
        self.check_open()?;
        let key = Self::branch_key(device);
        if self.vars.contains_key(&key) {
            return Err(Error::DuplicateUnknown(key));
        }
        let (index, _) = self.vars.insert_full(key, VarKind::Branch);
        Ok(VarId(index))
    }

    /// Find a node voltage by name (ground yields `None`).
    pub fn lookup(&self, name: &str) -> Option<VarId> {
        self.vars
            .get_full(name)
            .filter(|(_, _, kind)| **kind == VarKind::Node)
            .map(|(index, _, _)| VarId(index))
    }

    /// Find the branch current owned by a device.
    pub fn lookup_branch(&self, device: &str) -> Option<VarId> {
        self.vars
            .get_index_of(&Self::branch_key(device))
            .map(VarId)
    }

    pub fn alloc_state(&mut self, count: usize) -> Result<StateSlot> {
        self.check_open()?;
        let slot = StateSlot(self.num_states);
        self.num_states += count;
        Ok(slot)
    }

    pub fn alloc_store(&mut self, count: usize) -> Result<StoreSlot> {
        self.check_open()?;
        let slot = StoreSlot(self.num_stores);
        self.num_stores += count;
        Ok(slot)
    }

    /// Freeze the numbering.
    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn num_unknowns(&self) -> usize {
        self.vars.len()
    }

    pub fn num_states(&self) -> usize {
        self.num_states
    }

    pub fn num_stores(&self) -> usize {
        self.num_stores
    }

    pub fn var_name(&self, id: VarId) -> Option<&str> {
        self.vars.get_index(id.0).map(|(name, _)| name.as_str())
    }

    pub fn var_kind(&self, id: VarId) -> Option<VarKind> {
        self.vars.get_index(id.0).map(|(_, kind)| *kind)
    }

    /// Iterate over `(name, id, kind)` in index order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, VarId, VarKind)> {
        self.vars
            .iter()
            .enumerate()
            .map(|(i, (name, kind))| (name.as_str(), VarId(i), *kind))
    }

    fn branch_key(device: &str) -> String {
        format!("{}#branch", device)
    }

    fn check_open(&self) -> Result<()> {
        if self.finalized {
            Err(Error::TopologyFinalized)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ground_has_no_unknown() {
        let mut topo = Topology::new();
        assert_eq!(topo.node("0").unwrap(), None);
        assert_eq!(topo.node("GND").unwrap(), None);
        assert_eq!(topo.num_unknowns(), 0);
    }

    #[test]
    fn nodes_are_shared_and_branches_unique() {
        let mut topo = Topology::new();
        let a = topo.node("a").unwrap().unwrap();
        let a2 = topo.node("a").unwrap().unwrap();
        assert_eq!(a, a2);

        let br = topo.branch("V1").unwrap();
        assert_eq!(br.index(), 1);
        assert!(topo.branch("V1").is_err());
        assert_eq!(topo.lookup_branch("V1"), Some(br));
        assert_eq!(topo.var_kind(br), Some(VarKind::Branch));
        assert_eq!(topo.var_name(a), Some("a"));
    }

    #[test]
    fn finalized_topology_rejects_new_unknowns() {
        let mut topo = Topology::new();
        topo.node("a").unwrap();
        topo.finalize();

        assert!(topo.node("a").unwrap().is_some());
        assert!(matches!(topo.node("b"), Err(Error::TopologyFinalized)));
        assert!(matches!(topo.alloc_state(1), Err(Error::TopologyFinalized)));
    }

    #[test]
    fn state_slots_are_contiguous() {
        let mut topo = Topology::new();
        let s0 = topo.alloc_state(2).unwrap();
        let s1 = topo.alloc_state(1).unwrap();
        assert_eq!(s0.at(1), 1);
        assert_eq!(s1.at(0), 2);
        assert_eq!(topo.num_states(), 3);
    }
}
