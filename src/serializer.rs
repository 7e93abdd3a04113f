//! On-disk wire format for node images and the file header (spec §4.1
//! "Serializer").
//!
//! Every node image is: a 4-byte size prefix, a 1-byte type tag, a layout
//! version, the node's own fields, a trailing CRC32, and a trailing size
//! word equal to the prefix (so a reader can sanity-check from either
//! end, following `original_source/newbrt/rbuf.h`'s length-prefixed read
//! style). Decode validates the prefix/trailer agree, the CRC matches, the
//! type tag is one of the two node kinds, and that re-summing the CRC of
//! every decoded message/pair reproduces the node's stored local
//! fingerprint; any mismatch is a [`Error::FormatError`].

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

use crate::cow_bytes::CowBytes;
use crate::error::{Error, Result};
use crate::fifo::MessageFifo;
use crate::fingerprint::{crc32, FingerprintAccumulator};
use crate::header::{Header, RootDirectory};
use crate::message::{DupMode, Message, MessageType};
use crate::node::{InternalNode, LeafNode, Lsn, Node, NodeOffset};

const LAYOUT_VERSION: u16 = 1;
const TAG_LEAF: u8 = 1;
const TAG_INTERNAL: u8 = 2;
const TAG_HEADER: u8 = 3;

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> io::Result<()> {
    buf.write_u32::<BigEndian>(bytes.len() as u32)?;
    buf.write_all(bytes)
}

fn read_bytes(cur: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = cur
        .read_u32::<BigEndian>()
        .map_err(|e| Error::FormatError(e.to_string()))? as usize;
    let mut out = vec![0u8; len];
    cur.read_exact(&mut out)
        .map_err(|e| Error::FormatError(e.to_string()))?;
    Ok(out)
}

fn write_message(buf: &mut Vec<u8>, msg: &Message) -> io::Result<()> {
    let tag = match msg.kind {
        MessageType::Insert => 0u8,
        MessageType::DeletePoint => 1u8,
        MessageType::DeleteBoth => 2u8,
    };
    buf.write_u8(tag)?;
    buf.write_u64::<BigEndian>(msg.txn_id)?;
    write_bytes(buf, &msg.key)?;
    match &msg.value {
        Some(v) => {
            buf.write_u8(1)?;
            write_bytes(buf, v)?;
        }
        None => buf.write_u8(0)?,
    }
    Ok(())
}

fn read_message(cur: &mut Cursor<&[u8]>) -> Result<Message> {
    let tag = cur.read_u8().map_err(|e| Error::FormatError(e.to_string()))?;
    let txn_id = cur
        .read_u64::<BigEndian>()
        .map_err(|e| Error::FormatError(e.to_string()))?;
    let key = CowBytes::from(read_bytes(cur)?.as_slice());
    let has_value = cur.read_u8().map_err(|e| Error::FormatError(e.to_string()))?;
    let value = if has_value == 1 {
        Some(CowBytes::from(read_bytes(cur)?.as_slice()).into_sliced())
    } else {
        None
    };
    let kind = match tag {
        0 => MessageType::Insert,
        1 => MessageType::DeletePoint,
        2 => MessageType::DeleteBoth,
        other => return Err(Error::FormatError(format!("unknown message tag {other}"))),
    };
    Ok(Message {
        kind,
        key,
        value,
        txn_id,
    })
}

/// Encode a single message in the same wire format used inside an internal
/// node's FIFO, for use by a `BrtEnq`/`BrtDeq` log record payload (spec §4.5
/// "BrtEnq carries the enqueued message's own encoding").
pub fn encode_message(msg: &Message) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_message(&mut buf, msg)?;
    Ok(buf)
}

/// Decode a single message previously encoded by [`encode_message`], for
/// replaying a `BrtEnq` record during recovery.
pub fn decode_message(bytes: &[u8]) -> Result<Message> {
    let mut cur = Cursor::new(bytes);
    read_message(&mut cur)
}

/// Encode a node into a fixed-size, zero-padded image of exactly
/// `node_size` bytes. Fails (rather than silently truncating) if the
/// node's content does not fit — callers are expected to have already
/// split the node before this is reached (spec §3 "For every cached node:
/// serialized size <= nodesize").
pub fn encode_node(node: &Node, node_size: u32) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    match node {
        Node::Leaf(leaf) => {
            body.write_u8(TAG_LEAF)?;
            body.write_u16::<BigEndian>(LAYOUT_VERSION)?;
            body.write_u32::<BigEndian>(0)?; // height, always 0 for leaves
            body.write_u32::<BigEndian>(dup_mode_flags(leaf.store.dup_mode()))?;
            body.write_u32::<BigEndian>(leaf.store.len() as u32)?;
            body.write_u32::<BigEndian>(leaf.store.salt())?;
            for (k, v) in leaf.store.iter() {
                write_bytes(&mut body, k)?;
                write_bytes(&mut body, v)?;
            }
            body.write_u32::<BigEndian>(leaf.store.local_fingerprint())?;
            body.write_u64::<BigEndian>(leaf.disk_lsn.0)?;
            body.write_u64::<BigEndian>(leaf.log_lsn.0)?;
        }
        Node::Internal(node) => {
            body.write_u8(TAG_INTERNAL)?;
            body.write_u16::<BigEndian>(LAYOUT_VERSION)?;
            body.write_u32::<BigEndian>(node.height)?;
            body.write_u32::<BigEndian>(0)?; // flags reserved on internal nodes
            body.write_u32::<BigEndian>(node.children.len() as u32)?;
            for child in &node.children {
                body.write_u64::<BigEndian>(child.0)?;
            }
            for pivot in &node.pivots {
                write_bytes(&mut body, pivot)?;
            }
            for fifo in &node.child_fifos {
                body.write_u32::<BigEndian>(fifo.len() as u32)?;
                for msg in fifo.iter() {
                    write_message(&mut body, msg)?;
                }
            }
            for fp in &node.subtree_fingerprints {
                body.write_u32::<BigEndian>(*fp)?;
            }
            body.write_u32::<BigEndian>(node.salt)?;
            body.write_u32::<BigEndian>(node.local_fingerprint())?;
            body.write_u64::<BigEndian>(node.disk_lsn.0)?;
            body.write_u64::<BigEndian>(node.log_lsn.0)?;
        }
    }

    finish_framed_image(body, node_size)
}

fn dup_mode_flags(mode: DupMode) -> u32 {
    mode.to_flags()
}

fn finish_framed_image(body: Vec<u8>, node_size: u32) -> Result<Vec<u8>> {
    let crc = crc32(&body);
    let total_len = (body.len() + 4) as u32; // body + trailing crc, not counting prefix/postfix themselves
    if total_len as usize + 8 > node_size as usize {
        return Err(Error::FormatError(format!(
            "serialized node ({} bytes) exceeds node_size ({} bytes)",
            total_len as usize + 8,
            node_size
        )));
    }
    let mut image = Vec::with_capacity(node_size as usize);
    image.write_u32::<BigEndian>(total_len)?;
    image.extend_from_slice(&body);
    image.write_u32::<BigEndian>(crc)?;
    image.write_u32::<BigEndian>(total_len)?;
    image.resize(node_size as usize, 0);
    Ok(image)
}

/// Decode a node image, validating length, CRC, type tag, and fingerprint
/// as specified in §4.1.
pub fn decode_node(image: &[u8]) -> Result<Node> {
    let mut cur = Cursor::new(image);
    let len_prefix = cur
        .read_u32::<BigEndian>()
        .map_err(|e| Error::FormatError(e.to_string()))?;
    if len_prefix < 4 {
        return Err(Error::FormatError("node image has no body (unwritten slot)".into()));
    }
    let body_start = cur.position() as usize;
    let body_end = body_start + (len_prefix as usize - 4);
    if body_end + 8 > image.len() {
        return Err(Error::FormatError("node image truncated".into()));
    }
    let body = &image[body_start..body_end];
    let crc_stored = (&image[body_end..body_end + 4]).read_u32::<BigEndian>()?;
    let len_postfix = (&image[body_end + 4..body_end + 8]).read_u32::<BigEndian>()?;
    if len_prefix != len_postfix {
        return Err(Error::FormatError("size prefix/postfix mismatch".into()));
    }
    let crc_computed = crc32(body);
    if crc_stored != crc_computed {
        return Err(Error::FormatError("CRC mismatch".into()));
    }

    let mut body_cur = Cursor::new(body);
    let tag = body_cur
        .read_u8()
        .map_err(|e| Error::FormatError(e.to_string()))?;
    let _version = body_cur.read_u16::<BigEndian>()?;
    match tag {
        TAG_LEAF => decode_leaf(&mut body_cur),
        TAG_INTERNAL => decode_internal(&mut body_cur),
        other => Err(Error::FormatError(format!(
            "unexpected node type tag {other} (expected leaf={TAG_LEAF} or internal={TAG_INTERNAL})"
        ))),
    }
}

fn decode_leaf(cur: &mut Cursor<&[u8]>) -> Result<Node> {
    let _height = cur.read_u32::<BigEndian>()?;
    let flags = cur.read_u32::<BigEndian>()?;
    let count = cur.read_u32::<BigEndian>()?;
    let salt = cur.read_u32::<BigEndian>()?;
    let dup_mode = DupMode::from_flags(flags);
    let mut store = crate::leaf_store::LeafStore::new(dup_mode, salt);
    let mut acc = FingerprintAccumulator::new();
    for _ in 0..count {
        let key = read_bytes(cur)?;
        let value = read_bytes(cur)?;
        acc.add(crate::fingerprint::crc32_pair(&key, &value));
        store.insert_or_replace(CowBytes::from(key.as_slice()), CowBytes::from(value.as_slice()).into_sliced());
    }
    let stored_fp = cur.read_u32::<BigEndian>()?;
    if acc.fingerprint(salt) != stored_fp {
        return Err(Error::FormatError("leaf fingerprint mismatch".into()));
    }
    let disk_lsn = Lsn(cur.read_u64::<BigEndian>()?);
    let log_lsn = Lsn(cur.read_u64::<BigEndian>()?);
    Ok(Node::Leaf(LeafNode {
        store,
        dirty: false,
        disk_lsn,
        log_lsn,
    }))
}

fn decode_internal(cur: &mut Cursor<&[u8]>) -> Result<Node> {
    let height = cur.read_u32::<BigEndian>()?;
    let _flags = cur.read_u32::<BigEndian>()?;
    let n = cur.read_u32::<BigEndian>()? as usize;
    let mut children = Vec::with_capacity(n);
    for _ in 0..n {
        children.push(NodeOffset(cur.read_u64::<BigEndian>()?));
    }
    let mut pivots = Vec::with_capacity(n.saturating_sub(1));
    for _ in 0..n.saturating_sub(1) {
        pivots.push(CowBytes::from(read_bytes(cur)?.as_slice()));
    }
    let mut child_fifos = Vec::with_capacity(n);
    let mut acc = FingerprintAccumulator::new();
    for _ in 0..n {
        let msg_count = cur.read_u32::<BigEndian>()?;
        let mut fifo = MessageFifo::new();
        for _ in 0..msg_count {
            let msg = read_message(cur)?;
            acc.add(msg.crc());
            fifo.enqueue(msg);
        }
        child_fifos.push(fifo);
    }
    let mut subtree_fingerprints = Vec::with_capacity(n);
    for _ in 0..n {
        subtree_fingerprints.push(cur.read_u32::<BigEndian>()?);
    }
    let salt = cur.read_u32::<BigEndian>()?;
    let stored_fp = cur.read_u32::<BigEndian>()?;
    if acc.fingerprint(salt) != stored_fp {
        return Err(Error::FormatError("internal node fingerprint mismatch".into()));
    }
    let disk_lsn = Lsn(cur.read_u64::<BigEndian>()?);
    let log_lsn = Lsn(cur.read_u64::<BigEndian>()?);
    Ok(Node::Internal(InternalNode::from_decoded(
        height,
        children,
        pivots,
        child_fifos,
        subtree_fingerprints,
        salt,
        acc,
        disk_lsn,
        log_lsn,
    )))
}

/// Encode the file header (spec §4.1 "Header encoding", §6 "File layout").
/// The header is always at file offset 0 and is itself checksummed, with
/// the same framing as a node image.
pub fn encode_header(header: &Header, node_size: u32) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    body.write_u8(TAG_HEADER)?;
    body.write_u16::<BigEndian>(LAYOUT_VERSION)?;
    body.write_u32::<BigEndian>(header.flags)?;
    body.write_u32::<BigEndian>(header.node_size)?;
    match header.freelist_head {
        Some(off) => {
            body.write_u8(1)?;
            body.write_u64::<BigEndian>(off.0)?;
        }
        None => body.write_u8(0)?,
    }
    body.write_u64::<BigEndian>(header.unused_memory.0)?;
    match &header.root_directory {
        RootDirectory::Unnamed(off) => {
            body.write_u8(0)?;
            body.write_u64::<BigEndian>(off.0)?;
        }
        RootDirectory::Named(entries) => {
            body.write_u8(1)?;
            body.write_u32::<BigEndian>(entries.len() as u32)?;
            for (name, off) in entries {
                write_bytes(&mut body, name.as_bytes())?;
                body.write_u64::<BigEndian>(off.0)?;
            }
        }
    }
    finish_framed_image(body, node_size)
}

pub fn decode_header(image: &[u8]) -> Result<Header> {
    let mut cur = Cursor::new(image);
    let len_prefix = cur.read_u32::<BigEndian>()?;
    if len_prefix < 4 {
        return Err(Error::FormatError("header image has no body (unwritten slot)".into()));
    }
    let body_start = cur.position() as usize;
    let body_end = body_start + (len_prefix as usize - 4);
    if body_end + 8 > image.len() {
        return Err(Error::FormatError("header image truncated".into()));
    }
    let body = &image[body_start..body_end];
    let crc_stored = (&image[body_end..body_end + 4]).read_u32::<BigEndian>()?;
    let len_postfix = (&image[body_end + 4..body_end + 8]).read_u32::<BigEndian>()?;
    if len_prefix != len_postfix {
        return Err(Error::FormatError("header size prefix/postfix mismatch".into()));
    }
    if crc_stored != crc32(body) {
        return Err(Error::FormatError("header CRC mismatch".into()));
    }
    let mut body_cur = Cursor::new(body);
    let tag = body_cur.read_u8()?;
    if tag != TAG_HEADER {
        return Err(Error::FormatError(format!("unexpected header tag {tag}")));
    }
    let _version = body_cur.read_u16::<BigEndian>()?;
    let flags = body_cur.read_u32::<BigEndian>()?;
    let node_size = body_cur.read_u32::<BigEndian>()?;
    let has_freelist = body_cur.read_u8()?;
    let freelist_head = if has_freelist == 1 {
        Some(NodeOffset(body_cur.read_u64::<BigEndian>()?))
    } else {
        None
    };
    let unused_memory = NodeOffset(body_cur.read_u64::<BigEndian>()?);
    let is_named = body_cur.read_u8()?;
    let root_directory = if is_named == 0 {
        RootDirectory::Unnamed(NodeOffset(body_cur.read_u64::<BigEndian>()?))
    } else {
        let count = body_cur.read_u32::<BigEndian>()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = String::from_utf8(read_bytes(&mut body_cur)?)
                .map_err(|e| Error::FormatError(e.to_string()))?;
            let off = NodeOffset(body_cur.read_u64::<BigEndian>()?);
            entries.push((name, off));
        }
        RootDirectory::Named(entries)
    };
    Ok(Header {
        flags,
        node_size,
        freelist_head,
        unused_memory,
        root_directory,
        dirty: false,
    })
}
