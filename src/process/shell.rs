//! Command-line quoting.
//!
//! Commands are always executed from argument vectors. This is the single
//! place where a vector is rendered back into a shell-quoted line, for logs,
//! error payloads and fallback entries.

use std::borrow::Cow;

use shell_escape::escape;

/// Quote one argument so it survives shell interpolation unchanged.
pub fn quote(arg: &str) -> Cow<'_, str> {
    escape(Cow::Borrowed(arg))
}

/// Render `program args...` with every part quoted as needed.
pub fn render_command_line(program: &str, args: &[String]) -> String {
    std::iter::once(quote(program))
        .chain(args.iter().map(|a| quote(a)))
        .collect::<Vec<_>>()
        .join(" ")
}
