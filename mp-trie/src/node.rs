//! The trie node model: a tagged enum over branch, short (extension/leaf),
//! hash-reference and value nodes, with the cache metadata that drives
//! generational eviction.
//!
//! Encoding rules: a node whose RLP encoding is 32 bytes or longer is
//! referenced by its keccak256 hash; anything shorter embeds directly into
//! its parent. Decoding enforces the same bound on embedded children.

use alloy::primitives::{keccak256, B256};

use crate::{
    errors::{TrieError, TrieResult},
    nibbles::Nibbles,
    rlp,
};

pub const HASHED_LENGTH: usize = 32;

/// Caching metadata carried by branch and short nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeFlag {
    /// Cached hash of the node's encoding, if it has been computed and the
    /// node has not been mutated since.
    pub hash: Option<B256>,
    /// Cache generation the node was last committed in.
    pub gen: u16,
    /// Whether the node (or a resident descendant) has unserialized changes.
    pub dirty: bool,
}

impl NodeFlag {
    /// Flags for a freshly created or mutated node.
    pub fn dirty(gen: u16) -> Self {
        NodeFlag {
            hash: None,
            gen,
            dirty: true,
        }
    }

    /// Flags for a node decoded from its serialized form.
    pub fn cached(hash: Option<B256>, gen: u16) -> Self {
        NodeFlag {
            hash,
            gen,
            dirty: false,
        }
    }

    /// A node may be evicted to its hash reference once it is clean and old
    /// enough.
    pub fn can_unload(&self, gen: u16, limit: u16) -> bool {
        !self.dirty && gen.wrapping_sub(self.gen) >= limit
    }
}

#[derive(Debug, Clone)]
pub struct BranchNode {
    /// One child per hex nibble.
    pub children: [Node; 16],
    /// The terminal value slot.
    pub value: Option<Vec<u8>>,
    pub flags: NodeFlag,
}

impl BranchNode {
    pub fn new(gen: u16) -> Self {
        BranchNode {
            children: empty_children(),
            value: None,
            flags: NodeFlag::dirty(gen),
        }
    }

    pub fn insert(&mut self, index: usize, node: Node) {
        if index == 16 {
            self.value = match node {
                Node::Value(value) => Some(value),
                _ => None,
            };
        } else {
            self.children[index] = node;
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShortNode {
    /// Never empty. A trailing terminator nibble marks a leaf, in which case
    /// `val` is a value node; otherwise `val` is the extension target.
    pub key: Nibbles,
    pub val: Node,
    pub flags: NodeFlag,
}

#[derive(Debug, Clone, Default)]
pub enum Node {
    #[default]
    Empty,
    Branch(Box<BranchNode>),
    Short(Box<ShortNode>),
    /// A 32-byte reference to a node not resident in memory.
    Hash(B256),
    /// Raw stored bytes.
    Value(Vec<u8>),
}

pub fn empty_children() -> [Node; 16] {
    std::array::from_fn(|_| Node::Empty)
}

impl Node {
    pub fn from_leaf(key: Nibbles, value: Vec<u8>, gen: u16) -> Node {
        debug_assert!(key.is_leaf());
        Node::Short(Box::new(ShortNode {
            key,
            val: Node::Value(value),
            flags: NodeFlag::dirty(gen),
        }))
    }

    pub fn from_extension(prefix: Nibbles, node: Node, gen: u16) -> Node {
        Node::Short(Box::new(ShortNode {
            key: prefix,
            val: node,
            flags: NodeFlag::dirty(gen),
        }))
    }

    pub fn from_branch(branch: BranchNode) -> Node {
        Node::Branch(Box::new(branch))
    }

    pub fn from_hash(hash: B256) -> Node {
        Node::Hash(hash)
    }

    /// The cached hash and dirtiness, mirroring the flag layout. Hash and
    /// value nodes are always considered dirty so they are never skipped.
    pub fn cache(&self) -> (Option<B256>, bool) {
        match self {
            Node::Branch(b) => (b.flags.hash, b.flags.dirty),
            Node::Short(s) => (s.flags.hash, s.flags.dirty),
            _ => (None, true),
        }
    }

    pub fn can_unload(&self, gen: u16, limit: u16) -> bool {
        match self {
            Node::Branch(b) => b.flags.can_unload(gen, limit),
            Node::Short(s) => s.flags.can_unload(gen, limit),
            // Hash refs and values are already minimal.
            _ => false,
        }
    }
}

/// Structural equality, ignoring cache metadata.
impl PartialEq for Node {
    fn eq(&self, other: &Node) -> bool {
        match (self, other) {
            (Node::Empty, Node::Empty) => true,
            (Node::Branch(a), Node::Branch(b)) => a.children == b.children && a.value == b.value,
            (Node::Short(a), Node::Short(b)) => a.key == b.key && a.val == b.val,
            (Node::Hash(a), Node::Hash(b)) => a == b,
            (Node::Value(a), Node::Value(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Node {}

/// A node reference as it appears inside a parent's encoding.
pub enum EncodedNode {
    /// Referenced by hash; the encoding was 32 bytes or longer.
    Hash(B256),
    /// Embedded raw; strictly shorter than 32 bytes.
    Inline(Vec<u8>),
}

/// Encodes `node` in full, collapsing oversized children to hash refs and
/// caching computed hashes in the node flags.
pub fn encode_node(node: &mut Node, gen: u16) -> Vec<u8> {
    encode_inner(node, gen, false, &mut |_, _| {})
}

/// Hash of the standalone encoding, or `None` when the node is small enough
/// to only ever live embedded in its parent.
pub fn node_hash(node: &mut Node, gen: u16) -> Option<B256> {
    match write_node(node, gen, false, &mut |_, _| {}) {
        EncodedNode::Hash(h) => Some(h),
        EncodedNode::Inline(_) => None,
    }
}

/// Encodes `node` as a child reference. Every collapsed `(hash, encoding)`
/// pair is handed to `sink` in post-order; with `persist` set the node flags
/// are marked clean at `gen` afterwards.
pub fn write_node(
    node: &mut Node,
    gen: u16,
    persist: bool,
    sink: &mut dyn FnMut(B256, &[u8]),
) -> EncodedNode {
    match node {
        Node::Empty => EncodedNode::Inline(vec![rlp::EMPTY_STRING_CODE]),
        Node::Hash(h) => EncodedNode::Hash(*h),
        Node::Value(v) => EncodedNode::Inline(rlp::encode_bytes(v)),
        Node::Branch(_) | Node::Short(_) => {
            // A clean cached hash short-circuits pure hashing. Persisting
            // walks clean subtrees anyway: a commit must re-write every
            // resident node so the stale-key sweep cannot reap one that is
            // still referenced.
            if !persist {
                if let (Some(hash), false) = node.cache() {
                    return EncodedNode::Hash(hash);
                }
            }
            let was_dirty = node.cache().1;
            let bytes = encode_inner(node, gen, persist, sink);
            if bytes.len() >= HASHED_LENGTH {
                let hash = keccak256(&bytes);
                sink(hash, &bytes);
                set_flags(node, Some(hash), gen, persist, was_dirty);
                EncodedNode::Hash(hash)
            } else {
                set_flags(node, None, gen, persist, was_dirty);
                EncodedNode::Inline(bytes)
            }
        }
    }
}

fn set_flags(node: &mut Node, hash: Option<B256>, gen: u16, persist: bool, was_dirty: bool) {
    let flags = match node {
        Node::Branch(b) => &mut b.flags,
        Node::Short(s) => &mut s.flags,
        _ => return,
    };
    flags.hash = hash;
    if persist {
        flags.dirty = false;
        // A node only moves to the current generation when it actually
        // changed; clean nodes keep aging towards eviction.
        if was_dirty {
            flags.gen = gen;
        }
    }
}

fn encode_inner(
    node: &mut Node,
    gen: u16,
    persist: bool,
    sink: &mut dyn FnMut(B256, &[u8]),
) -> Vec<u8> {
    let mut out = Vec::new();
    match node {
        Node::Empty => out.push(rlp::EMPTY_STRING_CODE),
        Node::Hash(h) => rlp::append_bytes(&mut out, h.as_slice()),
        Node::Value(v) => rlp::append_bytes(&mut out, v),
        Node::Short(s) => {
            let mut payload = Vec::new();
            rlp::append_bytes(&mut payload, &s.key.encode_compact());
            append_child(&mut payload, &mut s.val, gen, persist, sink);
            rlp::append_list_header(&mut out, payload.len());
            out.extend_from_slice(&payload);
        }
        Node::Branch(b) => {
            let mut payload = Vec::new();
            for child in b.children.iter_mut() {
                append_child(&mut payload, child, gen, persist, sink);
            }
            match &b.value {
                Some(v) => rlp::append_bytes(&mut payload, v),
                None => payload.push(rlp::EMPTY_STRING_CODE),
            }
            rlp::append_list_header(&mut out, payload.len());
            out.extend_from_slice(&payload);
        }
    }
    out
}

fn append_child(
    payload: &mut Vec<u8>,
    child: &mut Node,
    gen: u16,
    persist: bool,
    sink: &mut dyn FnMut(B256, &[u8]),
) {
    match write_node(child, gen, persist, sink) {
        EncodedNode::Hash(hash) => rlp::append_bytes(payload, hash.as_slice()),
        EncodedNode::Inline(raw) => payload.extend_from_slice(&raw),
    }
}

/// Replaces every unloadable resident subtree with its hash reference,
/// freeing the memory it held. This is the cache-eviction walker behind the
/// fast-sync state download.
pub fn unload_node(node: &mut Node, gen: u16, limit: u16) {
    let evict = match node {
        Node::Branch(b) if b.flags.can_unload(gen, limit) => b.flags.hash,
        Node::Short(s) if s.flags.can_unload(gen, limit) => s.flags.hash,
        _ => None,
    };
    if let Some(hash) = evict {
        *node = Node::Hash(hash);
        return;
    }
    match node {
        Node::Branch(b) => {
            for child in b.children.iter_mut() {
                unload_node(child, gen, limit);
            }
        }
        Node::Short(s) => unload_node(&mut s.val, gen, limit),
        _ => {}
    }
}

/// Parses the RLP encoding of a trie node. `hash` is the key the bytes were
/// loaded under, if any, and seeds the cache flags.
pub fn decode_node(hash: Option<B256>, buf: &[u8], gen: u16) -> TrieResult<Node> {
    decode(hash, buf, gen).map_err(DecodeError::into_trie_error)
}

struct DecodeError {
    cause: String,
    /// Breadcrumbs, innermost first.
    stack: Vec<String>,
}

impl DecodeError {
    fn new(cause: impl Into<String>) -> Self {
        DecodeError {
            cause: cause.into(),
            stack: Vec::new(),
        }
    }

    fn into_trie_error(self) -> TrieError {
        let path = self
            .stack
            .iter()
            .rev()
            .cloned()
            .collect::<Vec<_>>()
            .join("<-");
        TrieError::InvalidEncoding {
            path,
            cause: self.cause,
        }
    }
}

fn wrap<T>(result: Result<T, DecodeError>, ctx: &str) -> Result<T, DecodeError> {
    result.map_err(|mut err| {
        err.stack.push(ctx.to_string());
        err
    })
}

fn decode(hash: Option<B256>, buf: &[u8], gen: u16) -> Result<Node, DecodeError> {
    if buf.is_empty() {
        return Err(DecodeError::new("unexpected end of input"));
    }
    let (payload, _) = rlp::split_list(buf).map_err(|e| DecodeError::new(e.to_string()))?;
    match rlp::count_values(payload).map_err(|e| DecodeError::new(e.to_string()))? {
        2 => decode_short(hash, payload, gen),
        17 => decode_full(hash, payload, gen),
        n => Err(DecodeError::new(format!(
            "invalid number of list elements: {n}"
        ))),
    }
}

fn decode_short(hash: Option<B256>, payload: &[u8], gen: u16) -> Result<Node, DecodeError> {
    let (kbuf, rest) = wrap(
        rlp::split_bytes(payload).map_err(|e| DecodeError::new(e.to_string())),
        "short.key",
    )?;
    let key = wrap(
        Nibbles::from_compact(kbuf).map_err(|e| DecodeError::new(e.to_string())),
        "short.key",
    )?;
    let flags = NodeFlag::cached(hash, gen);
    if key.is_leaf() {
        let (val, _) = wrap(
            rlp::split_bytes(rest)
                .map_err(|e| DecodeError::new(format!("invalid value node: {e}"))),
            "short.val",
        )?;
        return Ok(Node::Short(Box::new(ShortNode {
            key,
            val: Node::Value(val.to_vec()),
            flags,
        })));
    }
    let (val, _) = wrap(decode_ref(rest, gen), "short.val")?;
    Ok(Node::Short(Box::new(ShortNode { key, val, flags })))
}

fn decode_full(hash: Option<B256>, payload: &[u8], gen: u16) -> Result<Node, DecodeError> {
    let mut children = empty_children();
    let mut rest = payload;
    for (i, slot) in children.iter_mut().enumerate() {
        let (child, after) = wrap(decode_ref(rest, gen), &format!("full[{i}]"))?;
        *slot = child;
        rest = after;
    }
    let (val, _) = wrap(
        rlp::split_bytes(rest).map_err(|e| DecodeError::new(e.to_string())),
        "full[16]",
    )?;
    Ok(Node::Branch(Box::new(BranchNode {
        children,
        value: (!val.is_empty()).then(|| val.to_vec()),
        flags: NodeFlag::cached(hash, gen),
    })))
}

fn decode_ref(buf: &[u8], gen: u16) -> Result<(Node, &[u8]), DecodeError> {
    let (kind, payload, rest) = rlp::split(buf).map_err(|e| DecodeError::new(e.to_string()))?;
    match kind {
        rlp::Kind::List => {
            // An embedded node reference must encode smaller than a hash.
            let size = buf.len() - rest.len();
            if size > HASHED_LENGTH {
                return Err(DecodeError::new(format!(
                    "oversized embedded node (size is {size} bytes, want size < {HASHED_LENGTH})"
                )));
            }
            let node = decode(None, &buf[..size], gen)?;
            Ok((node, rest))
        }
        rlp::Kind::Bytes if payload.is_empty() => Ok((Node::Empty, rest)),
        rlp::Kind::Bytes if payload.len() == HASHED_LENGTH => {
            Ok((Node::Hash(B256::from_slice(payload)), rest))
        }
        rlp::Kind::Bytes => Err(DecodeError::new(format!(
            "invalid RLP string size {} (want 0 or 32)",
            payload.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nibbles::TERMINATOR;

    #[test]
    fn decode_terminal_short_node() {
        // List of [compact key 0x20 (leaf, empty path), value 0x16].
        let buf = hex::decode("c22016").unwrap();
        let mut node = decode_node(None, &buf, 0).unwrap();

        let expected = Node::from_leaf(Nibbles::from_hex(&[TERMINATOR]), vec![0x16], 0);
        assert_eq!(node, expected);
        assert_eq!(encode_node(&mut node, 0), buf);
    }

    #[test]
    fn short_node_round_trip() {
        let mut node = Node::from_leaf(
            Nibbles::from_raw(b"key1", true),
            b"a-value-long-enough-to-not-embed".to_vec(),
            0,
        );
        let encoded = encode_node(&mut node, 0);
        assert!(encoded.len() >= HASHED_LENGTH);
        assert_eq!(node_hash(&mut node, 0), Some(keccak256(&encoded)));

        let decoded = decode_node(None, &encoded, 0).unwrap();
        assert_eq!(decoded, node);
    }

    #[test]
    fn branch_round_trip_with_mixed_children() {
        let mut branch = BranchNode::new(0);
        branch.insert(1, Node::from_hash(keccak256(b"child")));
        branch.insert(
            4,
            Node::from_leaf(Nibbles::from_hex(&[TERMINATOR]), vec![0x16], 0),
        );
        branch.value = Some(b"v".to_vec());
        let mut node = Node::from_branch(branch);

        let encoded = encode_node(&mut node, 0);
        let mut decoded = decode_node(None, &encoded, 0).unwrap();
        assert_eq!(decoded, node);
        assert_eq!(encode_node(&mut decoded, 0), encoded);
    }

    #[test]
    fn small_nodes_have_no_standalone_hash() {
        let mut node = Node::from_leaf(Nibbles::from_hex(&[TERMINATOR]), vec![0x16], 0);
        assert!(encode_node(&mut node, 0).len() < HASHED_LENGTH);
        assert_eq!(node_hash(&mut node, 0), None);
    }

    #[test]
    fn decode_rejects_bad_child_refs() {
        // A branch whose child 0 is a 31-byte string: neither empty, a hash,
        // nor an embedded list.
        let mut payload = Vec::new();
        rlp::append_bytes(&mut payload, &[0xaa; 31]);
        for _ in 1..17 {
            payload.push(rlp::EMPTY_STRING_CODE);
        }
        let mut buf = Vec::new();
        rlp::append_list_header(&mut buf, payload.len());
        buf.extend_from_slice(&payload);

        let err = decode_node(None, &buf, 0).unwrap_err();
        match err {
            TrieError::InvalidEncoding { path, cause } => {
                assert_eq!(path, "full[0]");
                assert!(cause.contains("invalid RLP string size 31"), "{cause}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn decode_error_breadcrumbs_nest() {
        // A two-item list whose key is a non-leaf path and whose child ref is
        // a 5-byte string, yielding an error under short.val.
        let mut payload = Vec::new();
        rlp::append_bytes(&mut payload, &[0x11]); // extension, path [1]
        rlp::append_bytes(&mut payload, &[0xbb; 5]);
        let mut buf = Vec::new();
        rlp::append_list_header(&mut buf, payload.len());
        buf.extend_from_slice(&payload);

        let err = decode_node(None, &buf, 0).unwrap_err();
        match err {
            TrieError::InvalidEncoding { path, .. } => assert_eq!(path, "short.val"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn decode_error_breadcrumbs_cross_levels() {
        // Branch child 3 is an embedded short whose child ref is a 5-byte
        // string: the path reports both levels.
        let mut short = Vec::new();
        rlp::append_list(&mut short, |p| {
            rlp::append_bytes(p, &[0x11]); // extension, path [1]
            rlp::append_bytes(p, &[0xbb; 5]);
        });

        let mut payload = Vec::new();
        for i in 0..16 {
            if i == 3 {
                payload.extend_from_slice(&short);
            } else {
                payload.push(rlp::EMPTY_STRING_CODE);
            }
        }
        payload.push(rlp::EMPTY_STRING_CODE);
        let mut buf = Vec::new();
        rlp::append_list_header(&mut buf, payload.len());
        buf.extend_from_slice(&payload);

        let err = decode_node(None, &buf, 0).unwrap_err();
        match err {
            TrieError::InvalidEncoding { path, .. } => assert_eq!(path, "full[3]<-short.val"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn oversized_embedded_child_rejected() {
        // Child encoded as an inline list of 33 bytes.
        let mut child = Vec::new();
        rlp::append_list(&mut child, |p| rlp::append_bytes(p, &[0xcc; 31]));
        assert_eq!(child.len(), 33);

        let mut payload = child;
        for _ in 1..17 {
            payload.push(rlp::EMPTY_STRING_CODE);
        }
        let mut buf = Vec::new();
        rlp::append_list_header(&mut buf, payload.len());
        buf.extend_from_slice(&payload);

        let err = decode_node(None, &buf, 0).unwrap_err();
        match err {
            TrieError::InvalidEncoding { cause, .. } => {
                assert!(cause.contains("oversized embedded node"), "{cause}")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unload_replaces_clean_old_nodes() {
        let mut node = Node::from_leaf(
            Nibbles::from_raw(b"key1", true),
            b"a-value-long-enough-to-not-embed".to_vec(),
            0,
        );
        let hash = {
            let mut sink = |_: B256, _: &[u8]| {};
            match write_node(&mut node, 0, true, &mut sink) {
                EncodedNode::Hash(h) => h,
                EncodedNode::Inline(_) => panic!("expected hashed node"),
            }
        };

        // Too recent: generation distance 0 < limit.
        unload_node(&mut node, 0, 2);
        assert!(matches!(node, Node::Short(_)));

        // Old enough.
        unload_node(&mut node, 2, 2);
        assert_eq!(node, Node::Hash(hash));
    }

    #[test]
    fn dirty_nodes_never_unload() {
        let mut node = Node::from_leaf(
            Nibbles::from_raw(b"key1", true),
            b"a-value-long-enough-to-not-embed".to_vec(),
            0,
        );
        encode_node(&mut node, 0);
        unload_node(&mut node, 100, 1);
        assert!(matches!(node, Node::Short(_)));
    }
}
