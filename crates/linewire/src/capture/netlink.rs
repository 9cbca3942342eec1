//! Minimal nfnetlink/NFQUEUE message framing. There is no netfilter-queue crate in the
//! dependency stack this crate follows, so these messages are hand-packed the way a small,
//! focused netlink client does it: fixed-size headers written field-by-field into a `Vec<u8>`,
//! padded to 4-byte alignment between netlink attributes.

pub const NETLINK_NETFILTER: i32 = 12;

const NFNL_SUBSYS_QUEUE: u8 = 5;

const NFQNL_MSG_PACKET: u8 = 0;
const NFQNL_MSG_VERDICT: u8 = 1;
const NFQNL_MSG_CONFIG: u8 = 2;

const NFQNL_CFG_CMD_BIND: u8 = 1;
const NFQNL_CFG_CMD_UNBIND: u8 = 2;

const NFQNL_COPY_PACKET: u8 = 2;

const NFQA_PACKET_HDR: u16 = 1;
const NFQA_VERDICT_HDR: u16 = 1;
const NFQA_PAYLOAD: u16 = 9;
const NFQA_CFG_CMD: u16 = 1;
const NFQA_CFG_PARAMS: u16 = 2;
const NFQA_CFG_QUEUE_MAXLEN: u16 = 4;

pub const NF_DROP: u32 = 0;

const NLM_F_REQUEST: u16 = 0x01;
const NLMSG_HDR_LEN: usize = 16;
const NFGENMSG_LEN: usize = 4;
const NLA_HDR_LEN: usize = 4;

fn nla_align(len: usize) -> usize {
    (len + 3) & !3
}

fn push_nlmsg_header(buf: &mut Vec<u8>, msg_type: u16, seq: u32) {
    buf.extend_from_slice(&0u32.to_ne_bytes()); // length, patched in `finish_nlmsg`
    buf.extend_from_slice(&msg_type.to_ne_bytes());
    buf.extend_from_slice(&NLM_F_REQUEST.to_ne_bytes());
    buf.extend_from_slice(&seq.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes()); // pid: let the kernel assign
}

fn push_nfgenmsg(buf: &mut Vec<u8>, queue_num: u16) {
    buf.push(libc::AF_UNSPEC as u8);
    buf.push(0); // nfnetlink version
    buf.extend_from_slice(&queue_num.to_be_bytes());
}

fn push_attr(buf: &mut Vec<u8>, attr_type: u16, payload: &[u8]) {
    let len = (NLA_HDR_LEN + payload.len()) as u16;
    buf.extend_from_slice(&len.to_ne_bytes());
    buf.extend_from_slice(&attr_type.to_ne_bytes());
    buf.extend_from_slice(payload);
    let padded = nla_align(payload.len());
    buf.resize(buf.len() + (padded - payload.len()), 0);
}

fn finish_nlmsg(mut buf: Vec<u8>) -> Vec<u8> {
    let len = buf.len() as u32;
    buf[0..4].copy_from_slice(&len.to_ne_bytes());
    buf
}

fn message_type(msg_type: u8) -> u16 {
    ((NFNL_SUBSYS_QUEUE as u16) << 8) | msg_type as u16
}

/// `NFQNL_MSG_CONFIG` / `NFQNL_CFG_CMD_BIND` (or unbind): registers this socket as the consumer
/// of `queue_num`.
pub fn config_cmd_message(queue_num: u16, seq: u32, bind: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    push_nlmsg_header(&mut buf, message_type(NFQNL_MSG_CONFIG), seq);
    push_nfgenmsg(&mut buf, queue_num);

    let command = if bind { NFQNL_CFG_CMD_BIND } else { NFQNL_CFG_CMD_UNBIND };
    let mut cmd_payload = Vec::with_capacity(4);
    cmd_payload.push(command);
    cmd_payload.push(0); // pad
    cmd_payload.extend_from_slice(&(libc::AF_INET as u16).to_be_bytes());
    push_attr(&mut buf, NFQA_CFG_CMD, &cmd_payload);

    finish_nlmsg(buf)
}

/// `NFQNL_MSG_CONFIG` / `NFQA_CFG_PARAMS`: requests full packet copies up to `copy_range` bytes.
pub fn config_params_message(queue_num: u16, seq: u32, copy_range: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    push_nlmsg_header(&mut buf, message_type(NFQNL_MSG_CONFIG), seq);
    push_nfgenmsg(&mut buf, queue_num);

    let mut params_payload = Vec::with_capacity(5);
    params_payload.extend_from_slice(&copy_range.to_be_bytes());
    params_payload.push(NFQNL_COPY_PACKET);
    push_attr(&mut buf, NFQA_CFG_PARAMS, &params_payload);

    finish_nlmsg(buf)
}

/// `NFQNL_MSG_CONFIG` / `NFQA_CFG_QUEUE_MAXLEN`: bounds the kernel-side backlog for this queue.
pub fn config_queue_maxlen_message(queue_num: u16, seq: u32, maxlen: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    push_nlmsg_header(&mut buf, message_type(NFQNL_MSG_CONFIG), seq);
    push_nfgenmsg(&mut buf, queue_num);
    push_attr(&mut buf, NFQA_CFG_QUEUE_MAXLEN, &maxlen.to_be_bytes());
    finish_nlmsg(buf)
}

/// `NFQNL_MSG_VERDICT`: tells the kernel what to do with a previously delivered packet.
pub fn verdict_message(queue_num: u16, seq: u32, packet_id: u32, verdict: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    push_nlmsg_header(&mut buf, message_type(NFQNL_MSG_VERDICT), seq);
    push_nfgenmsg(&mut buf, queue_num);

    let mut verdict_hdr = Vec::with_capacity(8);
    verdict_hdr.extend_from_slice(&verdict.to_be_bytes());
    verdict_hdr.extend_from_slice(&packet_id.to_be_bytes());
    push_attr(&mut buf, NFQA_VERDICT_HDR, &verdict_hdr);

    finish_nlmsg(buf)
}

/// A parsed `NFQNL_MSG_PACKET` notification: the kernel-assigned packet id (echoed back in the
/// verdict) and the raw IP payload, if the kernel included one.
pub struct PacketNotification {
    pub packet_id: u32,
    pub payload: Vec<u8>,
}

/// Parses a single `NFQNL_MSG_PACKET` message. Returns `None` for anything else (acks, errors,
/// other subsystems) so the read loop can skip it.
pub fn parse_packet_message(msg: &[u8]) -> Option<PacketNotification> {
    if msg.len() < NLMSG_HDR_LEN {
        return None;
    }
    let msg_type = u16::from_ne_bytes(msg[4..6].try_into().ok()?);
    if msg_type != message_type(NFQNL_MSG_PACKET) {
        return None;
    }

    let mut offset = NLMSG_HDR_LEN + NFGENMSG_LEN;
    let mut packet_id = None;
    let mut payload = None;

    while offset + NLA_HDR_LEN <= msg.len() {
        let attr_len = u16::from_ne_bytes(msg[offset..offset + 2].try_into().ok()?) as usize;
        let attr_type = u16::from_ne_bytes(msg[offset + 2..offset + 4].try_into().ok()?);
        if attr_len < NLA_HDR_LEN || offset + attr_len > msg.len() {
            break;
        }
        let data = &msg[offset + NLA_HDR_LEN..offset + attr_len];

        match attr_type {
            NFQA_PACKET_HDR if data.len() >= 4 => {
                packet_id = Some(u32::from_be_bytes(data[0..4].try_into().ok()?));
            }
            NFQA_PAYLOAD => {
                payload = Some(data.to_vec());
            }
            _ => {}
        }

        offset += nla_align(attr_len);
    }

    Some(PacketNotification {
        packet_id: packet_id?,
        payload: payload.unwrap_or_default(),
    })
}
