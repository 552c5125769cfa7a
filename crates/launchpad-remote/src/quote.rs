//! POSIX shell quoting for arguments passed through ssh.

/// Quote `s` so a POSIX shell reads it back as a single word.
///
/// Words made only of `[A-Za-z0-9@%+=:,./_-]` are returned unchanged.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty() && s.chars().all(is_safe) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r#"'"'"'"#))
}

/// Quote and space-join a whole argument vector.
pub fn shell_join<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|a| shell_quote(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c)
}
