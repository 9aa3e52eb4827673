//! Handle arguments passed to a child process.

use crate::error::{EndpointError, Result};

/// Prefix of the argument naming the pipe the client reads from.
pub const IN_PIPE_HANDLE_ARG: &str = "--InPipeHandle=";

/// Prefix of the argument naming the pipe the client writes to.
pub const OUT_PIPE_HANDLE_ARG: &str = "--OutPipeHandle=";

/// The two handle strings a client needs to open its pipes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHandles {
    /// Handle of the pipe the client reads from (server → client).
    pub input: String,
    /// Handle of the pipe the client writes to (client → server).
    pub output: String,
}

impl ClientHandles {
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }

    /// Find both handle arguments in a process argument list.
    ///
    /// Prefixes match case-insensitively; other arguments are ignored and the
    /// first occurrence of each prefix wins.
    pub fn from_args<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut input = None;
        let mut output = None;
        for arg in args {
            let arg = arg.as_ref();
            if input.is_none() {
                if let Some(value) = strip_prefix_ignore_case(arg, IN_PIPE_HANDLE_ARG) {
                    input = Some(value.to_string());
                    continue;
                }
            }
            if output.is_none() {
                if let Some(value) = strip_prefix_ignore_case(arg, OUT_PIPE_HANDLE_ARG) {
                    output = Some(value.to_string());
                }
            }
        }

        Ok(Self {
            input: required(input, IN_PIPE_HANDLE_ARG)?,
            output: required(output, OUT_PIPE_HANDLE_ARG)?,
        })
    }

    /// The two arguments to append to a child's command line.
    pub fn to_args(&self) -> [String; 2] {
        [
            format!("{IN_PIPE_HANDLE_ARG}{}", self.input),
            format!("{OUT_PIPE_HANDLE_ARG}{}", self.output),
        ]
    }
}

fn strip_prefix_ignore_case<'a>(arg: &'a str, prefix: &str) -> Option<&'a str> {
    let head = arg.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&arg[prefix.len()..])
    } else {
        None
    }
}

fn required(value: Option<String>, prefix: &str) -> Result<String> {
    match value {
        Some(value) if !value.is_empty() => Ok(value),
        Some(_) => Err(EndpointError::InvalidArgument(format!(
            "empty value for {prefix}<handle>"
        ))),
        None => Err(EndpointError::InvalidArgument(format!(
            "missing {prefix}<handle> argument"
        ))),
    }
}
