// Copyright 2026 The nsmdp Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use core::fmt;

#[macro_export]
macro_rules! make_err {
    ($code:expr, $($arg:tt)+) => {{
        $crate::Error::new(
            $code,
            format!("{}", format_args!($($arg)+)),
        )
    }};
}

#[macro_export]
macro_rules! error_if {
    ($cond:expr, $($arg:tt)+) => {{
        if $cond {
            Err($crate::make_err!($crate::Code::InvalidArgument, $($arg)+))?;
        }
    }};
}

/// Error carried through the plugin. `messages` grows by one entry per
/// [`ResultExt::err_tip`] on the way up, innermost first.
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct Error {
    pub code: Code,
    pub messages: Vec<String>,
}

impl Error {
    pub fn new(code: Code, msg: String) -> Self {
        let messages = if msg.is_empty() { Vec::new() } else { vec![msg] };
        Self { code, messages }
    }

    pub fn message_string(&self) -> String {
        self.messages.join(" : ")
    }
}

impl core::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("Error");
        builder.field("code", &self.code);
        if !self.messages.is_empty() {
            builder.field("messages", &self.messages);
        }
        builder.finish()
    }
}

impl From<Code> for Error {
    fn from(code: Code) -> Self {
        Self::new(code, String::new())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        make_err!(err.kind().into(), "{err}")
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        make_err!(Code::Internal, "{err}")
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        make_err!(Code::DeadlineExceeded, "{err}")
    }
}

impl From<serde_json5::Error> for Error {
    fn from(err: serde_json5::Error) -> Self {
        make_err!(Code::InvalidArgument, "{err}")
    }
}

/// Dial and serve failures on the unix sockets.
impl From<tonic::transport::Error> for Error {
    fn from(err: tonic::transport::Error) -> Self {
        make_err!(Code::Unavailable, "{err}")
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        make_err!(status.code().into(), "{status}")
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        Self::new(err.code.into(), err.message_string())
    }
}

pub trait ResultExt<T> {
    /// Converts the error, replaces its code and appends a message.
    fn err_tip_with_code<F, S>(self, tip_fn: F) -> Result<T, Error>
    where
        S: ToString,
        F: FnOnce(&Error) -> (Code, S);

    /// Appends a message, keeping the code.
    #[inline]
    fn err_tip<F, S>(self, tip_fn: F) -> Result<T, Error>
    where
        Self: Sized,
        S: ToString,
        F: FnOnce() -> S,
    {
        self.err_tip_with_code(|e| (e.code, tip_fn()))
    }
}

fn push_tip<F, S>(mut error: Error, tip_fn: F) -> Error
where
    S: ToString,
    F: FnOnce(&Error) -> (Code, S),
{
    let (code, message) = tip_fn(&error);
    error.code = code;
    error.messages.push(message.to_string());
    error
}

impl<T, E: Into<Error>> ResultExt<T> for Result<T, E> {
    #[inline]
    fn err_tip_with_code<F, S>(self, tip_fn: F) -> Result<T, Error>
    where
        S: ToString,
        F: FnOnce(&Error) -> (Code, S),
    {
        self.map_err(|e| push_tip(e.into(), tip_fn))
    }
}

/// `None` becomes an `Internal` error unless the tip picks another code.
impl<T> ResultExt<T> for Option<T> {
    #[inline]
    fn err_tip_with_code<F, S>(self, tip_fn: F) -> Result<T, Error>
    where
        S: ToString,
        F: FnOnce(&Error) -> (Code, S),
    {
        self.ok_or_else(|| push_tip(Code::Internal.into(), tip_fn))
    }
}

macro_rules! grpc_codes {
    ($($name:ident),+ $(,)?) => {
        /// gRPC status codes, mirrored so crates without tonic can match on them.
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        #[non_exhaustive]
        pub enum Code {
            $($name),+
        }

        impl From<tonic::Code> for Code {
            fn from(code: tonic::Code) -> Self {
                match code {
                    $(tonic::Code::$name => Self::$name),+
                }
            }
        }

        impl From<Code> for tonic::Code {
            fn from(code: Code) -> Self {
                match code {
                    $(Code::$name => Self::$name),+
                }
            }
        }
    };
}

grpc_codes!(
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
);

impl From<std::io::ErrorKind> for Code {
    fn from(kind: std::io::ErrorKind) -> Self {
        use std::io::ErrorKind;
        match kind {
            ErrorKind::NotFound => Self::NotFound,
            ErrorKind::PermissionDenied => Self::PermissionDenied,
            ErrorKind::AlreadyExists => Self::AlreadyExists,
            ErrorKind::InvalidInput | ErrorKind::InvalidData => Self::InvalidArgument,
            ErrorKind::TimedOut => Self::DeadlineExceeded,
            ErrorKind::Interrupted => Self::Aborted,
            // A kubelet or plugin socket that is gone or not accepting yet.
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe => Self::Unavailable,
            ErrorKind::AddrInUse
            | ErrorKind::AddrNotAvailable
            | ErrorKind::WouldBlock
            | ErrorKind::WriteZero
            | ErrorKind::Other
            | ErrorKind::UnexpectedEof => Self::Internal,
            _ => Self::Unknown,
        }
    }
}
