use crate::codec;
use crate::codec::Config;
use crate::error::Error;
use crate::error::Result;
use crate::plan::state::State;
use crate::Arbitrary;

/// One densely indexed slot of the planner tree: a state plus its links.
#[derive(Debug, Clone, PartialEq)]
pub struct Slot<C: Config> {
    state: State<C>,
    parent: Option<usize>,
    children: Vec<usize>,
}

impl<C: Config> Slot<C> {
    pub fn state(&self) -> &State<C> {
        &self.state
    }
    pub fn parent(&self) -> Option<usize> {
        self.parent
    }
    pub fn children(&self) -> &[usize] {
        &self.children
    }

    fn encode(&self, buf: &mut Vec<u8>) -> u64 {
        let mut written = self.state.encode(buf);
        written += codec::put_i64(buf, self.parent.map_or(-1, |p| p as i64));
        written += codec::put_seq(buf, &self.children, |&c, b| codec::put_u64(b, c as u64));
        written
    }

    fn decode(buf: &[u8], at: u64) -> Result<(Self, u64)> {
        let (state, mut consumed) = State::decode(buf, at)?;
        let (parent, read) = codec::get_i64(buf, at + consumed)?;
        consumed += read;
        let parent = match parent {
            -1 => None,
            index if index >= 0 => Some(index as usize),
            other => {
                return Err(Error::Malformed(format!(
                    "parent index must be -1 or non-negative, got {}",
                    other
                )))
            }
        };
        let (children, read) = codec::get_seq(buf, at + consumed, |b, a| {
            let (child, n) = codec::get_u64(b, a)?;
            Ok((child as usize, n))
        })?;
        consumed += read;
        let slot = Self {
            state,
            parent,
            children,
        };
        Ok((slot, consumed))
    }
}

/// The planner tree: an append-only, densely indexed sequence of states.
///
/// Slot 0 is the root; every later slot names an earlier slot as its parent,
/// so parents always precede children and indices stay stable as
/// runtime-learned states are appended.
#[derive(Debug, Clone, PartialEq)]
pub struct Tree<C: Config>(Vec<Slot<C>>);

impl<C: Config> Default for Tree<C> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<C: Config> Tree<C> {
    pub fn new(root: State<C>) -> Self {
        Self(vec![Slot {
            state: root,
            parent: None,
            children: Vec::new(),
        }])
    }

    /// append a state under `parent`, returning the new index
    pub fn attach(&mut self, parent: usize, state: State<C>) -> Result<usize> {
        if parent >= self.0.len() {
            return Err(Error::InvalidInput(format!(
                "parent index ({}) out of range for a tree of {} states",
                parent,
                self.0.len()
            )));
        }
        let index = self.0.len();
        self.0.push(Slot {
            state,
            parent: Some(parent),
            children: Vec::new(),
        });
        // new indices only grow, so pushing keeps the child list sorted
        self.0[parent].children.push(index);
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn state(&self, index: usize) -> &State<C> {
        &self.0[index].state
    }

    pub(crate) fn state_mut(&mut self, index: usize) -> &mut State<C> {
        &mut self.0[index].state
    }

    pub fn parent(&self, index: usize) -> Option<usize> {
        self.0[index].parent
    }

    pub fn children(&self, index: usize) -> &[usize] {
        &self.0[index].children
    }

    pub fn slots(&self) -> &[Slot<C>] {
        &self.0
    }

    /// verify that parent and child links mirror each other, that parents
    /// precede their children, and that child lists are sorted
    pub fn check_linkage(&self) -> bool {
        for (index, slot) in self.0.iter().enumerate() {
            match slot.parent {
                None => {
                    if index != 0 {
                        return false;
                    }
                }
                Some(parent) => {
                    if parent >= index {
                        return false;
                    }
                    if !self.0[parent].children.contains(&index) {
                        return false;
                    }
                }
            }
            let mut last = None;
            for &child in &slot.children {
                if child >= self.0.len() {
                    return false;
                }
                if self.0[child].parent != Some(index) {
                    return false;
                }
                if last.is_some_and(|previous| child <= previous) {
                    return false;
                }
                last = Some(child);
            }
        }
        true
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> u64 {
        codec::put_seq(buf, &self.0, |slot, b| slot.encode(b))
    }

    pub fn decode(buf: &[u8], at: u64) -> Result<(Self, u64)> {
        let (slots, consumed) = codec::get_seq(buf, at, Slot::decode)?;
        let tree = Self(slots);
        if !tree.check_linkage() {
            return Err(Error::Malformed("decoded tree has invalid linkage".into()));
        }
        Ok((tree, consumed))
    }
}

impl Arbitrary for Tree<f64> {
    fn random() -> Self {
        use rand::Rng;
        use rand::SeedableRng;
        let mut rng = rand::rngs::SmallRng::from_os_rng();
        let mut tree = Tree::new(State::anchor(0.0));
        for index in 1..rng.random_range(2..24) {
            let parent = rng.random_range(0..index);
            let state = State::random().with_transition(index as u64, index as u64 + 1000);
            tree.attach(parent, state).expect("parent precedes child");
        }
        tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_nodes() -> Tree<f64> {
        let mut tree = Tree::new(State::anchor(0.0));
        let middle = tree
            .attach(0, State::planned(1, 1.0, 1.0, vec![1.0]).with_transition(10, 11))
            .unwrap();
        tree.attach(middle, State::planned(2, 2.0, 2.0, vec![2.0]).with_transition(20, 21))
            .unwrap();
        tree
    }

    #[test]
    fn attach_links_both_directions() {
        let tree = three_nodes();
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.parent(0), None);
        assert_eq!(tree.parent(1), Some(0));
        assert_eq!(tree.parent(2), Some(1));
        assert_eq!(tree.children(0), &[1]);
        assert_eq!(tree.children(1), &[2]);
        assert!(tree.check_linkage());
    }

    #[test]
    fn attach_rejects_out_of_range_parents() {
        let mut tree = three_nodes();
        let orphan = State::planned(9, 9.0, 9.0, vec![9.0]);
        assert!(matches!(tree.attach(7, orphan), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn random_trees_keep_linkage() {
        for _ in 0..16 {
            assert!(Tree::random().check_linkage());
        }
    }

    #[test]
    fn codec_roundtrip() {
        for _ in 0..8 {
            let tree = Tree::random();
            let mut buf = Vec::new();
            let written = tree.encode(&mut buf);
            let (decoded, read) = Tree::<f64>::decode(&buf, 0).unwrap();
            assert_eq!(decoded, tree);
            assert_eq!(read, written);
        }
    }

    #[test]
    fn decode_rejects_broken_linkage() {
        let tree = three_nodes();
        let mut buf = Vec::new();
        tree.encode(&mut buf);
        // corrupt the root's parent field: it sits right after the root state
        let mut state_only = Vec::new();
        let state_bytes = tree.state(0).encode(&mut state_only) as usize;
        buf[8 + state_bytes] = 1;
        assert!(matches!(
            Tree::<f64>::decode(&buf, 0),
            Err(Error::Malformed(_))
        ));
    }
}
