//! Wire codec for Warp9 messages: encode/decode primitive types, QID, Dir,
//! and the full `FCall` catalog.
//!
//! Grounded in the teacher's `Encoder`/`Decoder` pattern (operator-overloaded
//! `<<`/`>>` via `Shl`/`Shr`, returning an `SResult` wrapper so field chains
//! short-circuit on the first failure) and further generalized to the
//! classic Warp9 message catalog (single-QID walk, signed 16-bit error
//! codes, numeric-uid attach/auth).

use crate::error::{Error, ErrCode, Result as WResult};
use crate::fcall::*;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{self, Read, Result as IoResult};
use std::ops::{Shl, Shr};

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };
}

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> IoResult<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

/// Wraps an `io::Result` so that `<<`/`>>` chains short-circuit.
pub struct SResult<T>(pub IoResult<T>);

/// A wrapper providing `<<`-chained encoding over a `WriteBytesExt`.
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    pub fn encode<T: Encodable>(&mut self, data: &T) -> IoResult<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// A wrapper providing `>>`-chained decoding over a `Read`.
#[derive(Clone, Debug)]
pub struct Decoder<R> {
    reader: R,
}

impl<R: Read> Decoder<R> {
    pub fn new(reader: R) -> Decoder<R> {
        Decoder { reader }
    }

    pub fn decode<T: Decodable>(&mut self) -> IoResult<T> {
        Decodable::decode(&mut self.reader)
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<'a, T: Decodable, R: Read> Shr<&'a mut T> for Decoder<R> {
    type Output = SResult<Decoder<R>>;
    fn shr(mut self, rhs: &'a mut T) -> Self::Output {
        match self.decode() {
            Ok(v) => {
                *rhs = v;
                SResult(Ok(self))
            }
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Decodable, R: Read> Shr<&'a mut T> for SResult<Decoder<R>> {
    type Output = Self;
    fn shr(self, rhs: &'a mut T) -> Self::Output {
        match self.0 {
            Ok(mut decoder) => match decoder.decode() {
                Ok(v) => {
                    *rhs = v;
                    SResult(Ok(decoder))
                }
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

pub trait Encodable {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> IoResult<usize>;
}

pub trait Decodable: Sized {
    fn decode<R: Read>(r: &mut R) -> IoResult<Self>;
}

macro_rules! impl_int {
    ($t:ty, $write:ident, $read:ident, $size:expr) => {
        impl Encodable for $t {
            fn encode<W: WriteBytesExt>(&self, w: &mut W) -> IoResult<usize> {
                w.$write::<LittleEndian>(*self)?;
                Ok($size)
            }
        }
        impl Decodable for $t {
            fn decode<R: Read>(r: &mut R) -> IoResult<Self> {
                r.$read::<LittleEndian>()
            }
        }
    };
}

impl_int!(u16, write_u16, read_u16, 2);
impl_int!(u32, write_u32, read_u32, 4);
impl_int!(u64, write_u64, read_u64, 8);
impl_int!(i16, write_i16, read_i16, 2);

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> IoResult<usize> {
        w.write_u8(*self)?;
        Ok(1)
    }
}
impl Decodable for u8 {
    fn decode<R: Read>(r: &mut R) -> IoResult<Self> {
        r.read_u8()
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> IoResult<usize> {
        let bytes = self.as_bytes();
        let n = bytes.len() as u16;
        w.write_u16::<LittleEndian>(n)?;
        w.write_all(bytes)?;
        Ok(2 + bytes.len())
    }
}
impl Decodable for String {
    fn decode<R: Read>(r: &mut R) -> IoResult<Self> {
        let n = r.read_u16::<LittleEndian>()? as usize;
        let buf = read_exact(r, n)?;
        String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl Encodable for Qid {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> IoResult<usize> {
        w.write_u8(self.typ.bits())?;
        w.write_u32::<LittleEndian>(self.version)?;
        w.write_u64::<LittleEndian>(self.path)?;
        Ok(13)
    }
}
impl Decodable for Qid {
    fn decode<R: Read>(r: &mut R) -> IoResult<Self> {
        let typ = QidType::from_bits_truncate(r.read_u8()?);
        let version = r.read_u32::<LittleEndian>()?;
        let path = r.read_u64::<LittleEndian>()?;
        Ok(Qid { typ, version, path })
    }
}

impl Encodable for Dir {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> IoResult<usize> {
        let sz = self.wire_size();
        w.write_u16::<LittleEndian>((sz - 2) as u16)?;
        self.qid.encode(w)?;
        w.write_u32::<LittleEndian>(self.mode)?;
        w.write_u32::<LittleEndian>(self.atime)?;
        w.write_u32::<LittleEndian>(self.mtime)?;
        w.write_u64::<LittleEndian>(self.length)?;
        self.name.encode(w)?;
        w.write_u32::<LittleEndian>(self.uid)?;
        w.write_u32::<LittleEndian>(self.gid)?;
        w.write_u32::<LittleEndian>(self.muid)?;
        Ok(sz)
    }
}
impl Decodable for Dir {
    fn decode<R: Read>(r: &mut R) -> IoResult<Self> {
        let _dirsize = r.read_u16::<LittleEndian>()?;
        let qid = Qid::decode(r)?;
        let mode = r.read_u32::<LittleEndian>()?;
        let atime = r.read_u32::<LittleEndian>()?;
        let mtime = r.read_u32::<LittleEndian>()?;
        let length = r.read_u64::<LittleEndian>()?;
        let name = String::decode(r)?;
        let uid = r
            .read_u32::<LittleEndian>()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad uid"))?;
        let gid = r
            .read_u32::<LittleEndian>()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad gid"))?;
        let muid = r
            .read_u32::<LittleEndian>()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad muid"))?;
        Ok(Dir { qid, mode, atime, mtime, length, name, uid, gid, muid })
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> IoResult<usize> {
        w.write_u32::<LittleEndian>(self.0.len() as u32)?;
        w.write_all(&self.0)?;
        Ok(4 + self.0.len())
    }
}

fn decode_data<R: Read>(r: &mut R) -> IoResult<Data> {
    let n = r.read_u32::<LittleEndian>()? as usize;
    Ok(Data(read_exact(r, n)?))
}

fn decode_wnames<R: Read>(r: &mut R) -> IoResult<Vec<String>> {
    let n = r.read_u16::<LittleEndian>()?;
    let mut v = Vec::with_capacity(n as usize);
    for _ in 0..n {
        v.push(String::decode(r)?);
    }
    Ok(v)
}

fn encode_wnames<W: WriteBytesExt>(names: &[String], w: &mut W) -> IoResult<usize> {
    w.write_u16::<LittleEndian>(names.len() as u16)?;
    let mut n = 2;
    for name in names {
        n += name.encode(w)?;
    }
    Ok(n)
}

impl Encodable for FCall {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> IoResult<usize> {
        use FCall::*;
        Ok(match self {
            Tversion { msize, version } => {
                w.write_u32::<LittleEndian>(*msize)?;
                4 + version.encode(w)?
            }
            Rversion { msize, version } => {
                w.write_u32::<LittleEndian>(*msize)?;
                4 + version.encode(w)?
            }
            Tauth { afid, uid, aname } => {
                w.write_u32::<LittleEndian>(*afid)?;
                w.write_u32::<LittleEndian>(*uid)?;
                8 + aname.encode(w)?
            }
            Rauth { aqid } => aqid.encode(w)?,
            Tattach { fid, afid, uid, aname } => {
                w.write_u32::<LittleEndian>(*fid)?;
                w.write_u32::<LittleEndian>(*afid)?;
                w.write_u32::<LittleEndian>(*uid)?;
                12 + aname.encode(w)?
            }
            Rattach { qid } => qid.encode(w)?,
            Rerror { code, ename } => {
                w.write_i16::<LittleEndian>(*code)?;
                2 + ename.clone().unwrap_or_default().encode(w)?
            }
            Tflush { oldtag } => {
                w.write_u16::<LittleEndian>(*oldtag)?;
                2
            }
            Rflush => 0,
            Twalk { fid, newfid, wname } => {
                w.write_u32::<LittleEndian>(*fid)?;
                w.write_u32::<LittleEndian>(*newfid)?;
                8 + encode_wnames(wname, w)?
            }
            Rwalk { wqid } => wqid.encode(w)?,
            Topen { fid, mode } => {
                w.write_u32::<LittleEndian>(*fid)?;
                w.write_u8(*mode)?;
                5
            }
            Ropen { qid, iounit } => {
                let n = qid.encode(w)?;
                w.write_u32::<LittleEndian>(*iounit)?;
                n + 4
            }
            Tcreate { fid, name, perm, mode } => {
                w.write_u32::<LittleEndian>(*fid)?;
                let n = name.encode(w)?;
                w.write_u32::<LittleEndian>(*perm)?;
                w.write_u8(*mode)?;
                4 + n + 5
            }
            Rcreate { qid, iounit } => {
                let n = qid.encode(w)?;
                w.write_u32::<LittleEndian>(*iounit)?;
                n + 4
            }
            Tread { fid, offset, count } => {
                w.write_u32::<LittleEndian>(*fid)?;
                w.write_u64::<LittleEndian>(*offset)?;
                w.write_u32::<LittleEndian>(*count)?;
                16
            }
            Rread { data } => data.encode(w)?,
            Twrite { fid, offset, data } => {
                w.write_u32::<LittleEndian>(*fid)?;
                w.write_u64::<LittleEndian>(*offset)?;
                12 + data.encode(w)?
            }
            Rwrite { count } => {
                w.write_u32::<LittleEndian>(*count)?;
                4
            }
            Tclunk { fid } => {
                w.write_u32::<LittleEndian>(*fid)?;
                4
            }
            Rclunk => 0,
            Tremove { fid } => {
                w.write_u32::<LittleEndian>(*fid)?;
                4
            }
            Rremove => 0,
            Tstat { fid } => {
                w.write_u32::<LittleEndian>(*fid)?;
                4
            }
            Rstat { stat } => stat.encode(w)?,
            Twstat { fid, stat } => {
                w.write_u32::<LittleEndian>(*fid)?;
                4 + stat.encode(w)?
            }
            Rwstat => 0,
        })
    }
}

/// Decodes a message body given its already-parsed `MsgType`.
fn decode_body<R: Read>(typ: MsgType, r: &mut R) -> IoResult<FCall> {
    use MsgType::*;
    Ok(match typ {
        Tversion => FCall::Tversion { msize: decode!(*r), version: decode!(*r) },
        Rversion => FCall::Rversion { msize: decode!(*r), version: decode!(*r) },
        Tauth => FCall::Tauth { afid: decode!(*r), uid: decode!(*r), aname: decode!(*r) },
        Rauth => FCall::Rauth { aqid: decode!(*r) },
        Tattach => FCall::Tattach {
            fid: decode!(*r),
            afid: decode!(*r),
            uid: decode!(*r),
            aname: decode!(*r),
        },
        Rattach => FCall::Rattach { qid: decode!(*r) },
        Rerror => {
            let code = i16::decode(r)?;
            let s = String::decode(r)?;
            FCall::Rerror { code, ename: if s.is_empty() { None } else { Some(s) } }
        }
        Tflush => FCall::Tflush { oldtag: decode!(*r) },
        Rflush => FCall::Rflush,
        Twalk => {
            let fid = u32::decode(r)?;
            let newfid = u32::decode(r)?;
            let wname = decode_wnames(r)?;
            FCall::Twalk { fid, newfid, wname }
        }
        Rwalk => FCall::Rwalk { wqid: decode!(*r) },
        Topen => FCall::Topen { fid: decode!(*r), mode: decode!(*r) },
        Ropen => FCall::Ropen { qid: decode!(*r), iounit: decode!(*r) },
        Tcreate => FCall::Tcreate {
            fid: decode!(*r),
            name: decode!(*r),
            perm: decode!(*r),
            mode: decode!(*r),
        },
        Rcreate => FCall::Rcreate { qid: decode!(*r), iounit: decode!(*r) },
        Tread => FCall::Tread { fid: decode!(*r), offset: decode!(*r), count: decode!(*r) },
        Rread => FCall::Rread { data: decode_data(r)? },
        Twrite => {
            let fid = u32::decode(r)?;
            let offset = u64::decode(r)?;
            let data = decode_data(r)?;
            FCall::Twrite { fid, offset, data }
        }
        Rwrite => FCall::Rwrite { count: decode!(*r) },
        Tclunk => FCall::Tclunk { fid: decode!(*r) },
        Rclunk => FCall::Rclunk,
        Tremove => FCall::Tremove { fid: decode!(*r) },
        Rremove => FCall::Rremove,
        Tstat => FCall::Tstat { fid: decode!(*r) },
        Rstat => FCall::Rstat { stat: decode!(*r) },
        Twstat => FCall::Twstat { fid: decode!(*r), stat: decode!(*r) },
        Rwstat => FCall::Rwstat,
        Terror | Tget | Rget | Tput | Rput | Treport | Rreport | Tstream | Rstream => {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "unknown-message"));
        }
    })
}

/// Packs a tagged message into its full wire representation, preamble
/// included, `size` filled in last.
pub fn write_msg(msg: &Msg) -> WResult<Vec<u8>> {
    let mut body = Vec::new();
    msg.body
        .encode(&mut body)
        .map_err(|_| Error::new(ErrCode::Bufsz))?;

    let typ = msg.body.msg_type() as u8;
    let size = FIXED_FCALL_SZ as usize + body.len();

    let mut out = Vec::with_capacity(size);
    out.write_u32::<LittleEndian>(size as u32)
        .map_err(Error::from)?;
    out.write_u8(typ).map_err(Error::from)?;
    out.write_u16::<LittleEndian>(msg.tag)
        .map_err(Error::from)?;
    out.extend_from_slice(&body);
    Ok(out)
}

/// Parses one complete message from `buf`, which must hold at least one
/// full frame (`size` bytes). Returns the parsed message and the number of
/// bytes consumed.
pub fn read_msg(buf: &[u8]) -> WResult<(Msg, usize)> {
    if buf.len() < FIXED_FCALL_SZ as usize {
        return Err(Error::new(ErrCode::Badmsgsz));
    }
    let mut cur = io::Cursor::new(buf);
    let size = cur.read_u32::<LittleEndian>().map_err(Error::from)? as usize;
    if size < FIXED_FCALL_SZ as usize || size > buf.len() {
        return Err(Error::new(ErrCode::Badmsgsz));
    }
    let typ_byte = cur.read_u8().map_err(Error::from)?;
    let tag = cur.read_u16::<LittleEndian>().map_err(Error::from)?;
    let typ = MsgType::from_u8(typ_byte).ok_or_else(Error::badw9msg)?;

    let body_len = size - FIXED_FCALL_SZ as usize;
    if (body_len as u32) < typ.min_body_size() {
        return Err(Error::new(ErrCode::Badmsgsz));
    }

    // A decode failure this far in is always a body that ran out of bytes
    // mid-field (a truncated Twalk name list, Rread/Twrite data, ...) since
    // the fixed preamble and the minimum-body-size check above already
    // passed; report it as a bad message size, not a generic invalid value.
    let mut body_buf = io::Cursor::new(&buf[FIXED_FCALL_SZ as usize..size]);
    let body = decode_body(typ, &mut body_buf).map_err(|_| Error::new(ErrCode::Badmsgsz))?;
    Ok((Msg { tag, body }, size))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(body: FCall, tag: u16) -> Msg {
        let msg = Msg { tag, body };
        let bytes = write_msg(&msg).unwrap();
        let (decoded, consumed) = read_msg(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, msg);
        decoded
    }

    #[test]
    fn version_roundtrip() {
        roundtrip(FCall::Tversion { msize: MSIZE, version: WARP9_VERSION.into() }, NOTAG);
    }

    #[test]
    fn walk_roundtrip_single_qid() {
        roundtrip(
            FCall::Twalk { fid: 1, newfid: 2, wname: vec!["a".into(), "b".into()] },
            3,
        );
        roundtrip(FCall::Rwalk { wqid: Qid { typ: QidType::DIR, version: 0, path: 9 } }, 3);
    }

    #[test]
    fn rerror_with_and_without_message() {
        let m1 = roundtrip(FCall::Rerror { code: ErrCode::Noent as i16, ename: Some("x".into()) }, 1);
        assert!(matches!(m1.body, FCall::Rerror { ename: Some(_), .. }));
        let m2 = roundtrip(FCall::Rerror { code: ErrCode::Noent as i16, ename: None }, 1);
        assert!(matches!(m2.body, FCall::Rerror { ename: None, .. }));
    }

    #[test]
    fn dir_roundtrip_is_stable() {
        let d = Dir {
            qid: Qid { typ: QidType::empty(), version: 3, path: 42 },
            mode: 0o644,
            atime: 1,
            mtime: 2,
            length: 5,
            name: "hello".into(),
            uid: 1,
            gid: 1,
            muid: 1,
        };
        let mut buf = Vec::new();
        d.encode(&mut buf).unwrap();
        let d2 = Dir::decode(&mut io::Cursor::new(&buf)).unwrap();
        assert_eq!(d, d2);
        let mut buf2 = Vec::new();
        d2.encode(&mut buf2).unwrap();
        assert_eq!(buf, buf2);
    }

    #[test]
    fn truncated_buffer_fails_cleanly() {
        let msg = Msg { tag: 1, body: FCall::Tversion { msize: MSIZE, version: "W90.0".into() } };
        let bytes = write_msg(&msg).unwrap();
        let err = read_msg(&bytes[..bytes.len() - 2]).unwrap_err();
        assert_eq!(err.code, ErrCode::Badmsgsz as i16);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut bytes = write_msg(&Msg { tag: 1, body: FCall::Rflush }).unwrap();
        bytes[4] = 106; // Terror
        let err = read_msg(&bytes).unwrap_err();
        assert_eq!(err.code, ErrCode::Badw9msg as i16);
    }
}
