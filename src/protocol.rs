//! 9P2000 protocol constants and the message-type enumeration.

use std::fmt;

use crate::error::Error;

/// Special values used by the protocol.
pub const NO_FID: u32 = 0xFFFF_FFFF;
pub const NO_TAG: u16 = 0xFFFF;

/// The only protocol dialect this crate speaks.
pub const VERSION_9P2000: &str = "9P2000";
/// Version string a server answers with when it does not understand the client.
pub const VERSION_UNKNOWN: &str = "unknown";

/// size[4] type[1] tag[2]
pub const HEADER_SIZE: u32 = 4 + 1 + 2;

/// Room for the Tread/Rwrite framing around a data payload.
///
/// size[4] type[1] tag[2] fid[4] offset[8] count[4], rounded up.
pub const IOHDRSZ: u32 = 24;

pub const DEFAULT_MSIZE: u32 = 8192;
/// Lowest msize we agree to; anything smaller cannot carry a Stat.
pub const MIN_MSIZE: u32 = 256;

/// Open modes, as in open(5).
pub const OREAD: u8 = 0;
pub const OWRITE: u8 = 1;
pub const ORDWR: u8 = 2;
pub const OEXEC: u8 = 3;
pub const OTRUNC: u8 = 0x10;
pub const OCEXEC: u8 = 0x20;
pub const ORCLOSE: u8 = 0x40;

/// Stat mode bits.
pub const DMDIR: u32 = 0x8000_0000;
pub const DMAPPEND: u32 = 0x4000_0000;
pub const DMEXCL: u32 = 0x2000_0000;
pub const DMMOUNT: u32 = 0x1000_0000;
pub const DMAUTH: u32 = 0x0800_0000;
pub const DMTMP: u32 = 0x0400_0000;

macro_rules! message_types {
    ($($name:ident = $value:literal),* $(,)?) => {
        /// Every message type byte in the 9P2000 catalog.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum MessageType {
            $($name = $value,)*
        }

        impl TryFrom<u8> for MessageType {
            type Error = Error;

            fn try_from(value: u8) -> Result<Self, Error> {
                match value {
                    $($value => Ok(MessageType::$name),)*
                    other => Err(Error::UnknownType(other)),
                }
            }
        }

        impl fmt::Display for MessageType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let name = match self {
                    $(MessageType::$name => stringify!($name),)*
                };
                f.write_str(name)
            }
        }
    };
}

message_types! {
    Tversion = 100,
    Rversion = 101,
    Tauth = 102,
    Rauth = 103,
    Tattach = 104,
    Rattach = 105,
    Rerror = 107,
    Tflush = 108,
    Rflush = 109,
    Twalk = 110,
    Rwalk = 111,
    Topen = 112,
    Ropen = 113,
    Tcreate = 114,
    Rcreate = 115,
    Tread = 116,
    Rread = 117,
    Twrite = 118,
    Rwrite = 119,
    Tclunk = 120,
    Rclunk = 121,
    Tremove = 122,
    Rremove = 123,
    Tstat = 124,
    Rstat = 125,
    Twstat = 126,
    Rwstat = 127,
}

impl MessageType {
    /// Requests have even type bytes, replies odd ones.
    pub fn is_request(self) -> bool {
        (self as u8) % 2 == 0
    }
}
