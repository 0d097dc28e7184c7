//! Warp9's error model: a fixed, closed, non-positive 16-bit code catalog.
//!
//! Unlike the 9P2000.L dialect (which reports POSIX errno values), Warp9
//! reports a small framework-defined enumeration on the wire, optionally
//! paired with a human-readable string. Positive codes are reserved for
//! server-specific errors and are never interpreted by this crate.

use std::fmt;

/// A Warp9 framework error code, as carried on the wire in `Rerror`.
///
/// Matches the `W9Err` enumeration of the reference implementation
/// one-to-one; `Good` is the only non-negative framework code (`0`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum ErrCode {
    Good = 0,
    Badver = -1,
    Perm = -2,
    Notdir = -3,
    Noauth = -4,
    Notexist = -5,
    Inuse = -6,
    Exist = -7,
    Notowner = -8,
    Isopen = -9,
    Excl = -10,
    Ename = -11,
    Badw9msg = -12,
    Unknownfid = -13,
    Baduse = -14,
    Open = -15,
    Toolarge = -16,
    Badoffset = -17,
    Dirchange = -18,
    Nouser = -19,
    Notimpl = -20,
    Notempty = -21,
    Noent = -22,
    Notopen = -23,
    Baduser = -24,
    Msize = -25,
    Bufsz = -26,
    Badmsgid = -27,
    Baduid = -28,
    Badmsgsz = -29,
    Io = -30,
    Einval = -31,
    Dial = -32,
    Econn = -33,
    Fidnil = -34,
    Eof = -35,
    Authinit = -36,
    Authchk = -37,
    Authread = -38,
    Authwrite = -39,
    Fidnoaux = -40,
}

impl ErrCode {
    /// Diagnostic string for a framework code, matching the reference
    /// implementation's `ErrStr` table. Only used for logging/Rerror
    /// optional-message text; never interpreted programmatically.
    pub fn as_str(self) -> &'static str {
        use ErrCode::*;
        match self {
            Good => "no error",
            Badver => "unsupported version",
            Perm => "permission denied",
            Notdir => "not a directory",
            Noauth => "no-auth",
            Notexist => "no such object",
            Inuse => "fid: in use",
            Exist => "object exists",
            Notowner => "not owner",
            Isopen => "already open for I/O",
            Excl => "exclusive use object already open",
            Ename => "illegal name",
            Badw9msg => "unknown-message",
            Unknownfid => "unknown fid",
            Baduse => "bad-fid-use",
            Open => "fid-already-open",
            Toolarge => "io-too-large",
            Badoffset => "bad-directory-offset",
            Dirchange => "directory-conversion",
            Nouser => "unknown user",
            Notimpl => "not implemented",
            Notempty => "directory not empty",
            Noent => "no-entry-in-walk",
            Notopen => "not open",
            Baduser => "bad user",
            Msize => "msize too small",
            Bufsz => "buffer too small",
            Badmsgid => "bad message id",
            Baduid => "bad uid",
            Badmsgsz => "bad message size",
            Io => "I/O error",
            Einval => "invalid response",
            Dial => "dial failed",
            Econn => "connection closed",
            Fidnil => "nil fid",
            Eof => "end of data",
            Authinit => "auth-init failure",
            Authchk => "auth-check failure",
            Authread => "auth-read failure",
            Authwrite => "auth-write failure",
            Fidnoaux => "missing fid aux",
        }
    }

    /// Reconstructs an `ErrCode` from a wire value. Positive and out-of-range
    /// values are not framework codes and yield `None`.
    pub fn from_wire(code: i16) -> Option<ErrCode> {
        use ErrCode::*;
        Some(match code {
            0 => Good,
            -1 => Badver,
            -2 => Perm,
            -3 => Notdir,
            -4 => Noauth,
            -5 => Notexist,
            -6 => Inuse,
            -7 => Exist,
            -8 => Notowner,
            -9 => Isopen,
            -10 => Excl,
            -11 => Ename,
            -12 => Badw9msg,
            -13 => Unknownfid,
            -14 => Baduse,
            -15 => Open,
            -16 => Toolarge,
            -17 => Badoffset,
            -18 => Dirchange,
            -19 => Nouser,
            -20 => Notimpl,
            -21 => Notempty,
            -22 => Noent,
            -23 => Notopen,
            -24 => Baduser,
            -25 => Msize,
            -26 => Bufsz,
            -27 => Badmsgid,
            -28 => Baduid,
            -29 => Badmsgsz,
            -30 => Io,
            -31 => Einval,
            -32 => Dial,
            -33 => Econn,
            -34 => Fidnil,
            -35 => Eof,
            -36 => Authinit,
            -37 => Authchk,
            -38 => Authread,
            -39 => Authwrite,
            -40 => Fidnoaux,
            _ => return None,
        })
    }
}

/// A Warp9 error: a framework code or a server-specific positive code,
/// plus an optional diagnostic string carried alongside it on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub code: i16,
    pub msg: Option<String>,
}

impl Error {
    pub fn new(code: ErrCode) -> Self {
        Error {
            code: code as i16,
            msg: None,
        }
    }

    pub fn with_msg(code: ErrCode, msg: impl Into<String>) -> Self {
        Error {
            code: code as i16,
            msg: Some(msg.into()),
        }
    }

    /// Constructs a server-specific error from a positive application code.
    pub fn server(code: u16, msg: impl Into<String>) -> Self {
        Error {
            code: code as i16,
            msg: Some(msg.into()),
        }
    }

    pub fn framework_code(&self) -> Option<ErrCode> {
        ErrCode::from_wire(self.code)
    }

    pub fn is_server_specific(&self) -> bool {
        self.code > 0
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc = self
            .framework_code()
            .map(ErrCode::as_str)
            .unwrap_or("server error");
        match &self.msg {
            Some(m) if !m.is_empty() => write!(f, "{} ({})", desc, m),
            _ => write!(f, "{}", desc),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::with_msg(ErrCode::Io, e.to_string())
    }
}

/// Shorthand constructors for the codes used most often by callers.
macro_rules! err_ctor {
    ($name:ident, $code:ident) => {
        pub fn $name() -> Error {
            Error::new(ErrCode::$code)
        }
    };
}

impl Error {
    err_ctor!(badver, Badver);
    err_ctor!(perm, Perm);
    err_ctor!(notdir, Notdir);
    err_ctor!(noauth, Noauth);
    err_ctor!(notexist, Notexist);
    err_ctor!(inuse, Inuse);
    err_ctor!(exist, Exist);
    err_ctor!(notowner, Notowner);
    err_ctor!(isopen, Isopen);
    err_ctor!(excl, Excl);
    err_ctor!(ename, Ename);
    err_ctor!(badw9msg, Badw9msg);
    err_ctor!(unknownfid, Unknownfid);
    err_ctor!(baduse, Baduse);
    err_ctor!(open, Open);
    err_ctor!(toolarge, Toolarge);
    err_ctor!(badoffset, Badoffset);
    err_ctor!(dirchange, Dirchange);
    err_ctor!(nouser, Nouser);
    err_ctor!(notimpl, Notimpl);
    err_ctor!(notempty, Notempty);
    err_ctor!(noent, Noent);
    err_ctor!(notopen, Notopen);
    err_ctor!(baduser, Baduser);
    err_ctor!(msize, Msize);
    err_ctor!(bufsz, Bufsz);
    err_ctor!(badmsgid, Badmsgid);
    err_ctor!(baduid, Baduid);
    err_ctor!(badmsgsz, Badmsgsz);
    err_ctor!(io, Io);
    err_ctor!(einval, Einval);
    err_ctor!(dial, Dial);
    err_ctor!(econn, Econn);
    err_ctor!(fidnil, Fidnil);
    err_ctor!(eof, Eof);
    err_ctor!(authinit, Authinit);
    err_ctor!(authchk, Authchk);
    err_ctor!(authread, Authread);
    err_ctor!(authwrite, Authwrite);
    err_ctor!(fidnoaux, Fidnoaux);
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        for code in -40..=0i16 {
            if let Some(c) = ErrCode::from_wire(code) {
                assert_eq!(c as i16, code);
            }
        }
    }

    #[test]
    fn server_specific_is_positive() {
        let e = Error::server(7, "app defined");
        assert!(e.is_server_specific());
        assert!(e.framework_code().is_none());
    }

    #[test]
    fn display_includes_message() {
        let e = Error::with_msg(ErrCode::Noent, "walk");
        assert_eq!(format!("{}", e), "no-entry-in-walk (walk)");
    }
}
