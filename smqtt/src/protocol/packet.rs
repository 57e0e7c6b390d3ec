//! Control packets and their payload layouts.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::types::{ConnectReturnCode, Message, PacketType, QoS};

use super::PROTOCOL_NAME;
use super::codec::{
    header_flags, read_fixed_header, read_string, read_u8, read_u16, string_len,
    variable_int_len, write_fixed_header, write_string,
};

/// Longest client identifier a CONNECT may carry.
pub const MAX_CLIENT_ID_LEN: usize = 23;

const FLAG_USERNAME: u8 = 0x80;
const FLAG_PASSWORD: u8 = 0x40;
const FLAG_CLEAN_SESSION: u8 = 0x02;

/// A control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(u16),
    PingReq,
    PingResp,
    Disconnect,
}

// ============================================================================
// Decode dispatch
// ============================================================================

type DecodeFn = fn(u8, &[u8]) -> Result<Packet>;

/// Payload decoders indexed by the type nibble. Reserved codes have no entry.
static DECODERS: [Option<DecodeFn>; 16] = [
    None,
    Some(decode_connect),
    Some(decode_connack),
    Some(decode_publish),
    Some(decode_puback),
    Some(decode_pubrec),
    Some(decode_pubrel),
    Some(decode_pubcomp),
    Some(decode_subscribe),
    Some(decode_suback),
    Some(decode_unsubscribe),
    Some(decode_unsuback),
    Some(decode_pingreq),
    Some(decode_pingresp),
    Some(decode_disconnect),
    None,
];

fn decode_connect(_flags: u8, buf: &[u8]) -> Result<Packet> {
    Connect::read(buf).map(Packet::Connect)
}

fn decode_connack(_flags: u8, buf: &[u8]) -> Result<Packet> {
    ConnAck::read(buf).map(Packet::ConnAck)
}

fn decode_publish(flags: u8, buf: &[u8]) -> Result<Packet> {
    Publish::read(flags, buf).map(Packet::Publish)
}

fn decode_puback(_flags: u8, buf: &[u8]) -> Result<Packet> {
    read_packet_id_only(buf).map(Packet::PubAck)
}

fn decode_pubrec(_flags: u8, buf: &[u8]) -> Result<Packet> {
    read_packet_id_only(buf).map(Packet::PubRec)
}

fn decode_pubrel(_flags: u8, buf: &[u8]) -> Result<Packet> {
    read_packet_id_only(buf).map(Packet::PubRel)
}

fn decode_pubcomp(_flags: u8, buf: &[u8]) -> Result<Packet> {
    read_packet_id_only(buf).map(Packet::PubComp)
}

fn decode_subscribe(_flags: u8, buf: &[u8]) -> Result<Packet> {
    Subscribe::read(buf).map(Packet::Subscribe)
}

fn decode_suback(_flags: u8, buf: &[u8]) -> Result<Packet> {
    SubAck::read(buf).map(Packet::SubAck)
}

fn decode_unsubscribe(_flags: u8, buf: &[u8]) -> Result<Packet> {
    Unsubscribe::read(buf).map(Packet::Unsubscribe)
}

fn decode_unsuback(_flags: u8, buf: &[u8]) -> Result<Packet> {
    read_packet_id_only(buf).map(Packet::UnsubAck)
}

fn decode_pingreq(_flags: u8, buf: &[u8]) -> Result<Packet> {
    expect_empty(PacketType::PingReq, buf).map(|_| Packet::PingReq)
}

fn decode_pingresp(_flags: u8, buf: &[u8]) -> Result<Packet> {
    expect_empty(PacketType::PingResp, buf).map(|_| Packet::PingResp)
}

fn decode_disconnect(_flags: u8, buf: &[u8]) -> Result<Packet> {
    expect_empty(PacketType::Disconnect, buf).map(|_| Packet::Disconnect)
}

fn expect_empty(packet_type: PacketType, buf: &[u8]) -> Result<()> {
    if buf.is_empty() {
        Ok(())
    } else {
        Err(Error::malformed(format!(
            "{packet_type} carries no payload, got {} bytes",
            buf.len()
        )))
    }
}

fn read_packet_id_only(buf: &[u8]) -> Result<u16> {
    if buf.len() != 2 {
        return Err(Error::malformed(format!(
            "expected a 2 byte packet id, got {} bytes",
            buf.len()
        )));
    }
    read_u16(buf)
}

// ============================================================================
// Packet
// ============================================================================

impl Packet {
    /// Parse one frame from the front of `buf`.
    ///
    /// Returns the packet and the number of bytes it occupied. When `buf`
    /// does not yet hold the whole frame the error is [`Error::Incomplete`].
    pub fn read(buf: &[u8], max_size: usize) -> Result<(Packet, usize)> {
        let header = read_fixed_header(buf)?;
        let total_len = header.frame_length();

        if total_len > max_size {
            return Err(Error::PacketTooLarge { size: total_len, max: max_size });
        }

        if buf.len() < total_len {
            return Err(Error::Incomplete { needed: total_len - buf.len() });
        }

        let decode = DECODERS[header.packet_type as usize]
            .ok_or_else(|| Error::malformed(format!("no decoder for {}", header.packet_type)))?;

        let packet = decode(header.flags, &buf[header.header_length..total_len])?;
        Ok((packet, total_len))
    }

    /// Decode a buffer holding exactly one frame.
    pub fn decode(frame: &[u8]) -> Result<Packet> {
        match Packet::read(frame, usize::MAX) {
            Ok((packet, consumed)) if consumed == frame.len() => Ok(packet),
            Ok((_, consumed)) => Err(Error::invalid_argument(format!(
                "length mismatch: frame is {consumed} bytes, buffer is {}",
                frame.len()
            ))),
            Err(Error::Incomplete { needed }) => Err(Error::malformed(format!(
                "truncated frame: {needed} more bytes expected"
            ))),
            Err(e) => Err(e),
        }
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.size());
        self.write(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Append the encoded frame to `buf`.
    ///
    /// On error nothing is left behind in `buf`.
    pub fn write(&self, buf: &mut BytesMut) -> Result<usize> {
        let start = buf.len();
        match self.write_frame(buf) {
            Ok(()) => Ok(buf.len() - start),
            Err(e) => {
                buf.truncate(start);
                Err(e)
            }
        }
    }

    fn write_frame(&self, buf: &mut BytesMut) -> Result<()> {
        buf.reserve(self.size());
        write_fixed_header(buf, self.packet_type(), self.flags(), self.remaining_length())?;

        match self {
            Packet::Connect(p) => p.write(buf),
            Packet::ConnAck(p) => {
                p.write(buf);
                Ok(())
            }
            Packet::Publish(p) => p.write(buf),
            Packet::Subscribe(p) => p.write(buf),
            Packet::SubAck(p) => {
                p.write(buf);
                Ok(())
            }
            Packet::Unsubscribe(p) => p.write(buf),
            Packet::PubAck(id)
            | Packet::PubRec(id)
            | Packet::PubRel(id)
            | Packet::PubComp(id)
            | Packet::UnsubAck(id) => {
                buf.put_u16(*id);
                Ok(())
            }
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => Ok(()),
        }
    }

    /// Calculate the encoded frame size.
    pub fn size(&self) -> usize {
        let remaining = self.remaining_length();
        1 + variable_int_len(remaining) + remaining
    }

    fn remaining_length(&self) -> usize {
        match self {
            Packet::Connect(p) => p.remaining_length(),
            Packet::ConnAck(_) => 2,
            Packet::Publish(p) => p.remaining_length(),
            Packet::Subscribe(p) => p.remaining_length(),
            Packet::SubAck(_) => 3,
            Packet::Unsubscribe(p) => p.remaining_length(),
            Packet::PubAck(_)
            | Packet::PubRec(_)
            | Packet::PubRel(_)
            | Packet::PubComp(_)
            | Packet::UnsubAck(_) => 2,
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => 0,
        }
    }

    fn flags(&self) -> u8 {
        let (dup, retain) = match self {
            Packet::Publish(p) => (p.dup, p.retain),
            _ => (false, false),
        };
        header_flags(self.packet_type(), dup, self.qos(), retain)
    }

    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PubRec(_) => PacketType::PubRec,
            Packet::PubRel(_) => PacketType::PubRel,
            Packet::PubComp(_) => PacketType::PubComp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    /// QoS carried in the fixed header. Types without QoS support report 0.
    pub fn qos(&self) -> QoS {
        match self {
            Packet::Publish(p) => p.qos,
            Packet::Subscribe(p) => p.qos,
            _ => QoS::AtMostOnce,
        }
    }

    /// Set the QoS level from its raw value.
    ///
    /// Values outside 0..=2 fail for every packet type. The value is only
    /// stored by types that declare QoS support.
    pub fn set_qos(&mut self, qos: u8) -> Result<()> {
        let qos = QoS::try_from(qos)?;
        match self {
            Packet::Publish(p) => p.qos = qos,
            Packet::Subscribe(p) => p.qos = qos,
            _ => {}
        }
        Ok(())
    }

    /// Set the retain flag. Only PUBLISH carries it on the wire.
    pub fn set_retain(&mut self, retain: bool) {
        if let Packet::Publish(p) = self {
            p.retain = retain;
        }
    }

    /// Set the duplicate flag. Only PUBLISH carries it on the wire.
    pub fn set_duplicate(&mut self, dup: bool) {
        if let Packet::Publish(p) = self {
            p.dup = dup;
        }
    }
}

// ============================================================================
// CONNECT
// ============================================================================

/// CONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    client_id: String,
    protocol_level: u8,
    clean_session: bool,
    keep_alive: u16,
    username: Option<String>,
    password: Option<String>,
}

impl Connect {
    /// Create a CONNECT for `client_id` (1 to 23 characters).
    pub fn new(client_id: impl Into<String>) -> Result<Self> {
        let client_id = client_id.into();
        let len = client_id.chars().count();
        if !(1..=MAX_CLIENT_ID_LEN).contains(&len) {
            return Err(Error::invalid_argument(format!(
                "client id must be 1..={MAX_CLIENT_ID_LEN} characters, got {len}"
            )));
        }

        Ok(Self {
            client_id,
            protocol_level: 4,
            clean_session: false,
            keep_alive: 60,
            username: None,
            password: None,
        })
    }

    /// Set the protocol level (4 for 3.1.1, 5 for 5.0).
    pub fn with_protocol_level(mut self, level: u8) -> Result<Self> {
        if level != 4 && level != 5 {
            return Err(Error::invalid_argument(format!(
                "protocol level must be 4 or 5, got {level}"
            )));
        }
        self.protocol_level = level;
        Ok(self)
    }

    pub fn with_clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Set the username.
    pub fn with_username(mut self, username: impl Into<String>) -> Result<Self> {
        let username = username.into();
        check_string_len("username", &username)?;
        self.username = Some(username);
        Ok(self)
    }

    /// Set the password.
    pub fn with_password(mut self, password: impl Into<String>) -> Result<Self> {
        let password = password.into();
        check_string_len("password", &password)?;
        self.password = Some(password);
        Ok(self)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn protocol_level(&self) -> u8 {
        self.protocol_level
    }

    pub fn clean_session(&self) -> bool {
        self.clean_session
    }

    pub fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn read(buf: &[u8]) -> Result<Self> {
        let mut pos = 0;

        let (name, len) = read_string(buf)?;
        if name.as_bytes() != PROTOCOL_NAME {
            return Err(Error::malformed(format!("protocol name must be MQTT, got {name:?}")));
        }
        pos += len;

        let level = read_u8(&buf[pos..])?;
        if level != 4 && level != 5 {
            return Err(Error::malformed(format!("unsupported protocol level {level}")));
        }
        pos += 1;

        let flags = read_u8(&buf[pos..])?;
        pos += 1;

        let keep_alive = read_u16(&buf[pos..])?;
        pos += 2;

        let (client_id, len) = read_string(&buf[pos..])?;
        pos += len;

        let mut connect = Connect::new(client_id)?
            .with_protocol_level(level)?
            .with_clean_session(flags & FLAG_CLEAN_SESSION != 0)
            .with_keep_alive(keep_alive);

        if flags & FLAG_USERNAME != 0 {
            let (username, len) = read_string(&buf[pos..])?;
            connect.username = Some(username.to_string());
            pos += len;
        }

        if flags & FLAG_PASSWORD != 0 {
            let (password, len) = read_string(&buf[pos..])?;
            connect.password = Some(password.to_string());
            pos += len;
        }

        if pos != buf.len() {
            return Err(Error::malformed(format!(
                "{} trailing bytes after CONNECT payload",
                buf.len() - pos
            )));
        }

        Ok(connect)
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        write_string(buf, "MQTT")?;
        buf.put_u8(self.protocol_level);

        let mut flags = 0;
        if self.username.is_some() {
            flags |= FLAG_USERNAME;
        }
        if self.password.is_some() {
            flags |= FLAG_PASSWORD;
        }
        if self.clean_session {
            flags |= FLAG_CLEAN_SESSION;
        }
        buf.put_u8(flags);
        buf.put_u16(self.keep_alive);

        write_string(buf, &self.client_id)?;
        if let Some(ref username) = self.username {
            write_string(buf, username)?;
        }
        if let Some(ref password) = self.password {
            write_string(buf, password)?;
        }
        Ok(())
    }

    fn remaining_length(&self) -> usize {
        let mut len = string_len("MQTT") + 1 + 1 + 2; // name + level + flags + keep_alive
        len += string_len(&self.client_id);
        if let Some(ref username) = self.username {
            len += string_len(username);
        }
        if let Some(ref password) = self.password {
            len += string_len(password);
        }
        len
    }
}

// ============================================================================
// CONNACK
// ============================================================================

/// CONNACK packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    session_present: bool,
    code: ConnectReturnCode,
}

impl ConnAck {
    /// Create a CONNACK. `return_code` must be in 0..=5.
    pub fn new(session_present: bool, return_code: u8) -> Result<Self> {
        Ok(Self {
            session_present,
            code: ConnectReturnCode::try_from(return_code)?,
        })
    }

    pub fn accepted() -> Self {
        Self {
            session_present: false,
            code: ConnectReturnCode::Accepted,
        }
    }

    pub fn session_present(&self) -> bool {
        self.session_present
    }

    pub fn code(&self) -> ConnectReturnCode {
        self.code
    }

    pub fn return_code(&self) -> u8 {
        self.code as u8
    }

    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() != 2 {
            return Err(Error::invalid_argument(format!(
                "CONNACK payload must be 2 bytes, got {}",
                buf.len()
            )));
        }

        let session_present = match buf[0] {
            0x00 => false,
            0x01 => true,
            other => {
                return Err(Error::malformed(format!("invalid session present byte {other:#04x}")));
            }
        };

        ConnAck::new(session_present, buf[1])
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(self.session_present));
        buf.put_u8(self.code as u8);
    }
}

// ============================================================================
// PUBLISH
// ============================================================================

/// PUBLISH packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    topic: String,
    payload: Bytes,
    packet_id: u16,
    qos: QoS,
    retain: bool,
    dup: bool,
}

impl Publish {
    /// Create a PUBLISH. The topic must not be empty.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, packet_id: u16) -> Result<Self> {
        let topic = topic.into();
        check_topic(&topic)?;
        Ok(Self {
            topic,
            payload: payload.into(),
            packet_id,
            qos: QoS::AtMostOnce,
            retain: false,
            dup: false,
        })
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn with_dup(mut self, dup: bool) -> Self {
        self.dup = dup;
        self
    }

    /// Set the QoS level from its raw value.
    pub fn set_qos(&mut self, qos: u8) -> Result<()> {
        self.qos = QoS::try_from(qos)?;
        Ok(())
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload as UTF-8, if it is valid UTF-8.
    pub fn message(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn packet_id(&self) -> u16 {
        self.packet_id
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn retain(&self) -> bool {
        self.retain
    }

    pub fn dup(&self) -> bool {
        self.dup
    }

    pub fn read(flags: u8, buf: &[u8]) -> Result<Self> {
        let qos_bits = (flags >> 1) & 0x03;
        let qos = QoS::try_from(qos_bits)
            .map_err(|_| Error::malformed(format!("invalid PUBLISH qos {qos_bits}")))?;

        let (topic, len) = read_string(buf)?;
        if topic.is_empty() {
            return Err(Error::malformed("PUBLISH topic is empty"));
        }
        let packet_id = read_u16(&buf[len..])?;
        let payload = Bytes::copy_from_slice(&buf[len + 2..]);

        Ok(Self {
            topic: topic.to_string(),
            payload,
            packet_id,
            qos,
            retain: flags & 0x01 != 0,
            dup: flags & 0x08 != 0,
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        write_string(buf, &self.topic)?;
        buf.put_u16(self.packet_id);
        buf.put_slice(&self.payload);
        Ok(())
    }

    fn remaining_length(&self) -> usize {
        string_len(&self.topic) + 2 + self.payload.len()
    }
}

impl From<Publish> for Message {
    fn from(publish: Publish) -> Self {
        Message {
            topic: publish.topic,
            payload: publish.payload,
            retain: publish.retain,
        }
    }
}

// ============================================================================
// SUBSCRIBE / SUBACK
// ============================================================================

/// SUBSCRIBE packet for a single topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    packet_id: u16,
    topic: String,
    qos: QoS,
}

impl Subscribe {
    /// Create a SUBSCRIBE. The topic must not be empty.
    pub fn new(packet_id: u16, topic: impl Into<String>) -> Result<Self> {
        let topic = topic.into();
        check_topic(&topic)?;
        Ok(Self {
            packet_id,
            topic,
            qos: QoS::AtMostOnce,
        })
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Set the requested QoS from its raw value.
    pub fn set_qos(&mut self, qos: u8) -> Result<()> {
        self.qos = QoS::try_from(qos)?;
        Ok(())
    }

    pub fn packet_id(&self) -> u16 {
        self.packet_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn read(buf: &[u8]) -> Result<Self> {
        let packet_id = read_u16(buf)?;
        let (topic, len) = read_string(&buf[2..])?;
        if topic.is_empty() {
            return Err(Error::malformed("SUBSCRIBE topic is empty"));
        }
        let pos = 2 + len;

        let requested = read_u8(&buf[pos..])?;
        let qos = QoS::try_from(requested)
            .map_err(|_| Error::malformed(format!("invalid requested qos {requested}")))?;

        if pos + 1 != buf.len() {
            return Err(Error::malformed(format!(
                "{} trailing bytes after SUBSCRIBE payload",
                buf.len() - pos - 1
            )));
        }

        Ok(Self {
            packet_id,
            topic: topic.to_string(),
            qos,
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u16(self.packet_id);
        write_string(buf, &self.topic)?;
        buf.put_u8(self.qos as u8);
        Ok(())
    }

    fn remaining_length(&self) -> usize {
        2 + string_len(&self.topic) + 1
    }
}

/// SUBACK packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubAck {
    packet_id: u16,
    return_code: u8,
}

impl SubAck {
    /// Return code for a failed subscription.
    pub const FAILURE: u8 = 0x80;

    pub fn new(packet_id: u16, return_code: u8) -> Self {
        Self { packet_id, return_code }
    }

    pub fn packet_id(&self) -> u16 {
        self.packet_id
    }

    pub fn return_code(&self) -> u8 {
        self.return_code
    }

    pub fn is_success(&self) -> bool {
        self.return_code == 0
    }

    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() != 3 {
            return Err(Error::malformed(format!(
                "SUBACK payload must be 3 bytes, got {}",
                buf.len()
            )));
        }
        Ok(Self {
            packet_id: read_u16(buf)?,
            return_code: buf[2],
        })
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u16(self.packet_id);
        buf.put_u8(self.return_code);
    }
}

// ============================================================================
// UNSUBSCRIBE
// ============================================================================

/// UNSUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    packet_id: u16,
    topics: Vec<String>,
}

impl Unsubscribe {
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            topics: Vec::new(),
        }
    }

    /// Append a topic. The topic must not be empty.
    pub fn add_topic(&mut self, topic: impl Into<String>) -> Result<()> {
        let topic = topic.into();
        check_topic(&topic)?;
        self.topics.push(topic);
        Ok(())
    }

    pub fn with_topics<I, S>(mut self, topics: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for topic in topics {
            self.add_topic(topic)?;
        }
        Ok(self)
    }

    pub fn packet_id(&self) -> u16 {
        self.packet_id
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn read(buf: &[u8]) -> Result<Self> {
        let packet_id = read_u16(buf)?;
        let mut pos = 2;

        let mut topics = Vec::new();
        while pos < buf.len() {
            let (topic, len) = read_string(&buf[pos..])?;
            if topic.is_empty() {
                return Err(Error::malformed("UNSUBSCRIBE topic is empty"));
            }
            topics.push(topic.to_string());
            pos += len;
        }

        Ok(Self { packet_id, topics })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u16(self.packet_id);
        for topic in &self.topics {
            write_string(buf, topic)?;
        }
        Ok(())
    }

    fn remaining_length(&self) -> usize {
        2 + self.topics.iter().map(|t| string_len(t)).sum::<usize>()
    }
}

fn check_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::invalid_argument("topic must not be empty"));
    }
    check_string_len("topic", topic)
}

fn check_string_len(what: &str, s: &str) -> Result<()> {
    if s.len() > u16::MAX as usize {
        return Err(Error::invalid_argument(format!("{what} too long: {} bytes", s.len())));
    }
    Ok(())
}

// ============================================================================
// Helper functions for creating packets
// ============================================================================

/// Create a CONNECT packet.
pub fn create_connect(
    client_id: &str,
    username: Option<&str>,
    password: Option<&str>,
    keep_alive: u16,
    clean_session: bool,
) -> Result<Packet> {
    let mut connect = Connect::new(client_id)?
        .with_keep_alive(keep_alive)
        .with_clean_session(clean_session);
    if let Some(username) = username {
        connect = connect.with_username(username)?;
    }
    if let Some(password) = password {
        connect = connect.with_password(password)?;
    }
    Ok(Packet::Connect(connect))
}

/// Create an accepting CONNACK packet.
pub fn create_connack() -> Packet {
    Packet::ConnAck(ConnAck::accepted())
}

/// Create a SUBACK packet.
pub fn create_suback(packet_id: u16, return_code: u8) -> Packet {
    Packet::SubAck(SubAck::new(packet_id, return_code))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: Packet) -> Packet {
        let bytes = packet.encode().unwrap();
        assert_eq!(bytes.len(), packet.size(), "size() of {:?}", packet.packet_type());
        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded, packet);
        decoded
    }

    #[test]
    fn test_connect_roundtrip() {
        let connect = Connect::new("dev1").unwrap().with_keep_alive(30).with_clean_session(true);
        roundtrip(Packet::Connect(connect));

        let connect = Connect::new("dev2")
            .unwrap()
            .with_protocol_level(5)
            .unwrap()
            .with_username("alice")
            .unwrap()
            .with_password("secret")
            .unwrap();
        let decoded = roundtrip(Packet::Connect(connect));
        let Packet::Connect(c) = decoded else {
            panic!("Expected Connect packet");
        };
        assert_eq!(c.username(), Some("alice"));
        assert_eq!(c.password(), Some("secret"));
        assert_eq!(c.protocol_level(), 5);
    }

    #[test]
    fn test_connect_wire_layout() {
        let connect = Connect::new("ab").unwrap().with_clean_session(true).with_keep_alive(10);
        let bytes = Packet::Connect(connect).encode().unwrap();
        assert_eq!(
            &bytes[..],
            &[
                0x10, 14, // header
                0x00, 0x04, b'M', b'Q', b'T', b'T', // protocol name
                0x04, // level
                0x02, // clean session
                0x00, 0x0A, // keep alive
                0x00, 0x02, b'a', b'b', // client id
            ]
        );
    }

    #[test]
    fn test_connect_client_id_bounds() {
        assert!(matches!(Connect::new(""), Err(Error::InvalidArgument(_))));
        assert!(matches!(Connect::new("a".repeat(24)), Err(Error::InvalidArgument(_))));
        assert!(Connect::new("a".repeat(23)).is_ok());
    }

    #[test]
    fn test_connect_bad_protocol_name() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, "MQIsdp").unwrap();
        buf.put_slice(&[0x04, 0x00, 0x00, 0x3C]);
        write_string(&mut buf, "dev1").unwrap();
        assert!(matches!(Connect::read(&buf), Err(Error::InvalidMessageFormat(_))));
    }

    #[test]
    fn test_connect_bad_protocol_level() {
        assert!(Connect::new("dev1").unwrap().with_protocol_level(3).is_err());
    }

    #[test]
    fn test_connack_roundtrip() {
        roundtrip(Packet::ConnAck(ConnAck::new(false, 0).unwrap()));
        let decoded = roundtrip(Packet::ConnAck(ConnAck::new(true, 5).unwrap()));
        let Packet::ConnAck(ack) = decoded else {
            panic!("Expected ConnAck packet");
        };
        assert!(ack.session_present());
        assert_eq!(ack.code(), ConnectReturnCode::NotAuthorized);
    }

    #[test]
    fn test_connack_return_code_range() {
        assert!(matches!(ConnAck::new(false, 6), Err(Error::InvalidArgument(_))));
        assert!(matches!(ConnAck::read(&[0x00, 0x06]), Err(Error::InvalidArgument(_))));
        assert!(Packet::decode(&[0x20, 0x02, 0x00, 0x06]).is_err());
    }

    #[test]
    fn test_connack_length_mismatch() {
        assert!(ConnAck::read(&[0x00]).is_err());
        assert!(ConnAck::read(&[0x00, 0x00, 0x00]).is_err());
    }

    #[test]
    fn test_publish_roundtrip() {
        let publish = Publish::new("sensors/temp", "21.5", 7).unwrap();
        let decoded = roundtrip(Packet::Publish(publish));
        let Packet::Publish(p) = decoded else {
            panic!("Expected Publish packet");
        };
        assert_eq!(p.topic(), "sensors/temp");
        assert_eq!(p.message(), Some("21.5"));
        assert_eq!(p.packet_id(), 7);

        let empty = Publish::new("t", Bytes::new(), 1).unwrap();
        roundtrip(Packet::Publish(empty));
    }

    #[test]
    fn test_publish_flags() {
        let publish = Publish::new("t", "x", 9)
            .unwrap()
            .with_qos(QoS::AtLeastOnce)
            .with_retain(true)
            .with_dup(true);
        let bytes = Packet::Publish(publish.clone()).encode().unwrap();
        assert_eq!(bytes[0], 0x3B);
        roundtrip(Packet::Publish(publish));
    }

    #[test]
    fn test_publish_wire_layout() {
        let bytes = Packet::Publish(Publish::new("a", "hi", 0x0102).unwrap())
            .encode()
            .unwrap();
        assert_eq!(&bytes[..], &[0x30, 7, 0x00, 0x01, b'a', 0x01, 0x02, b'h', b'i']);
    }

    #[test]
    fn test_publish_into_message() {
        let publish = Publish::new("sensors/temp", "21.5", 3).unwrap().with_retain(true);
        let message = Message::from(publish);
        assert_eq!(message.topic, "sensors/temp");
        assert_eq!(message.payload_str(), Some("21.5"));
        assert!(message.retain);
    }

    #[test]
    fn test_publish_empty_topic() {
        assert!(matches!(Publish::new("", "x", 1), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_publish_qos_3_rejected() {
        assert!(matches!(
            Packet::decode(&[0x36, 0x05, 0x00, 0x01, b't', 0x00, 0x01]),
            Err(Error::InvalidMessageFormat(_))
        ));
    }

    #[test]
    fn test_set_qos() {
        let mut packet = Packet::Publish(Publish::new("t", "x", 1).unwrap());
        packet.set_qos(2).unwrap();
        assert_eq!(packet.qos(), QoS::ExactlyOnce);
        assert!(matches!(packet.set_qos(3), Err(Error::InvalidArgument(_))));
        assert_eq!(packet.qos(), QoS::ExactlyOnce);

        let mut ping = Packet::PingReq;
        assert!(ping.set_qos(3).is_err());
        ping.set_qos(1).unwrap();
        assert_eq!(ping.qos(), QoS::AtMostOnce);
        assert_eq!(ping.encode().unwrap()[0], 0xC0);
    }

    #[test]
    fn test_set_retain_and_duplicate() {
        let mut packet = Packet::Publish(Publish::new("t", "x", 1).unwrap());
        assert_eq!(packet.encode().unwrap()[0], 0x30);

        packet.set_retain(true);
        assert_eq!(packet.encode().unwrap()[0], 0x31);
        packet.set_duplicate(true);
        assert_eq!(packet.encode().unwrap()[0], 0x39);
        packet.set_retain(false);
        assert_eq!(packet.encode().unwrap()[0], 0x38);
        roundtrip(packet);

        // Other types keep their header byte.
        let mut ack = Packet::PubAck(5);
        ack.set_retain(true);
        ack.set_duplicate(true);
        assert_eq!(ack.encode().unwrap()[0], 0x40);

        let mut ping = Packet::PingReq;
        ping.set_retain(true);
        ping.set_duplicate(true);
        assert_eq!(&ping.encode().unwrap()[..], &[0xC0, 0x00]);
    }

    #[test]
    fn test_subscribe_roundtrip() {
        let subscribe = Subscribe::new(3, "sensors/temp").unwrap().with_qos(QoS::AtLeastOnce);
        let bytes = Packet::Subscribe(subscribe.clone()).encode().unwrap();
        assert_eq!(bytes[0], 0x82);
        roundtrip(Packet::Subscribe(subscribe));
        roundtrip(Packet::Subscribe(Subscribe::new(4, "u").unwrap()));
    }

    #[test]
    fn test_suback_roundtrip() {
        roundtrip(create_suback(3, 0));
        roundtrip(create_suback(4, SubAck::FAILURE));
    }

    #[test]
    fn test_unsubscribe_roundtrip() {
        roundtrip(Packet::Unsubscribe(Unsubscribe::new(1)));
        roundtrip(Packet::Unsubscribe(Unsubscribe::new(2).with_topics(["a"]).unwrap()));

        let mut unsubscribe = Unsubscribe::new(3);
        for topic in ["a", "b/c", "d"] {
            unsubscribe.add_topic(topic).unwrap();
        }
        let decoded = roundtrip(Packet::Unsubscribe(unsubscribe));
        let Packet::Unsubscribe(u) = decoded else {
            panic!("Expected Unsubscribe packet");
        };
        assert_eq!(u.topics(), ["a", "b/c", "d"]);
    }

    #[test]
    fn test_packet_id_only_roundtrip() {
        roundtrip(Packet::PubAck(7));
        roundtrip(Packet::PubRec(8));
        roundtrip(Packet::PubRel(9));
        roundtrip(Packet::PubComp(10));
        roundtrip(Packet::UnsubAck(11));
        assert_eq!(&Packet::PubAck(7).encode().unwrap()[..], &[0x40, 0x02, 0x00, 0x07]);
    }

    #[test]
    fn test_empty_packets_roundtrip() {
        assert_eq!(&Packet::PingReq.encode().unwrap()[..], &[0xC0, 0x00]);
        assert_eq!(&Packet::PingResp.encode().unwrap()[..], &[0xD0, 0x00]);
        assert_eq!(&Packet::Disconnect.encode().unwrap()[..], &[0xE0, 0x00]);
        roundtrip(Packet::PingReq);
        roundtrip(Packet::PingResp);
        roundtrip(Packet::Disconnect);
    }

    #[test]
    fn test_empty_packet_with_payload() {
        assert!(matches!(
            Packet::decode(&[0xC0, 0x01, 0x00]),
            Err(Error::InvalidMessageFormat(_))
        ));
    }

    #[test]
    fn test_reserved_type() {
        assert!(matches!(Packet::decode(&[0xF0, 0x00]), Err(Error::InvalidMessageFormat(_))));
        assert!(matches!(Packet::read(&[0x00, 0x00], 1024), Err(Error::InvalidMessageFormat(_))));
    }

    #[test]
    fn test_read_incomplete_and_multiple() {
        let mut buf = BytesMut::new();
        Packet::PingReq.write(&mut buf).unwrap();
        Packet::Publish(Publish::new("t", "abc", 1).unwrap()).write(&mut buf).unwrap();

        let (first, consumed) = Packet::read(&buf, 1024).unwrap();
        assert_eq!(first, Packet::PingReq);
        assert_eq!(consumed, 2);

        let rest = &buf[consumed..];
        assert!(matches!(
            Packet::read(&rest[..rest.len() - 1], 1024),
            Err(Error::Incomplete { needed: 1 })
        ));
        let (second, _) = Packet::read(rest, 1024).unwrap();
        assert_eq!(second.packet_type(), PacketType::Publish);
    }

    #[test]
    fn test_read_too_large() {
        let bytes = Packet::Publish(Publish::new("t", vec![0u8; 100], 1).unwrap())
            .encode()
            .unwrap();
        assert!(matches!(Packet::read(&bytes, 50), Err(Error::PacketTooLarge { .. })));
    }

    #[test]
    fn test_decode_length_mismatch() {
        let mut bytes = Packet::PingReq.encode().unwrap().to_vec();
        bytes.push(0);
        assert!(matches!(Packet::decode(&bytes), Err(Error::InvalidArgument(_))));
        assert!(matches!(
            Packet::decode(&[0x40, 0x02, 0x00]),
            Err(Error::InvalidMessageFormat(_))
        ));
    }
}
