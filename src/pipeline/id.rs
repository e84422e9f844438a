//! Identity types for the pipeline graph.
//!
//! `NodeId` indexes `PipelineGraph::nodes` directly. `DataId` names one
//! edge; id 0 is reserved for the external entry into the root node.

use std::fmt;

/// Index into `PipelineGraph::nodes`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub const INVALID: NodeId = NodeId(u32::MAX);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "NodeId(INVALID)")
        } else {
            write!(f, "NodeId({})", self.0)
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Routing id of one `from -> to` edge.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataId(pub u32);

impl DataId {
    /// Entry from outside the graph into its root node.
    pub const ROOT: DataId = DataId(0);

    #[inline]
    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }
}

impl fmt::Debug for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "DataId(ROOT)")
        } else {
            write!(f, "DataId({})", self.0)
        }
    }
}

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id() {
        let id = NodeId(42);
        assert!(id.is_valid());
        assert_eq!(id.index(), 42);
        assert!(!NodeId::INVALID.is_valid());
        assert_eq!(format!("{:?}", NodeId::INVALID), "NodeId(INVALID)");
    }

    #[test]
    fn test_data_id() {
        assert!(DataId::ROOT.is_root());
        assert!(!DataId(3).is_root());
        assert_eq!(DataId::ROOT.to_string(), "DataId(ROOT)");
        assert_eq!(DataId(3).to_string(), "DataId(3)");
    }
}
