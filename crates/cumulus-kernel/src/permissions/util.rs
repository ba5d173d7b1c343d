//! Permission string helpers.
//!
//! Permissions are `:`-separated components, e.g. `fs:<uid>:write`. A
//! component that itself contains `:` is escaped as `\C`.

/// Escape one component for embedding in a permission string.
pub fn escape_component(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for c in component.chars() {
        if c == ':' {
            out.push_str("\\C");
        } else {
            out.push(c);
        }
    }
    out
}

/// Undo [`escape_component`]. Unknown escapes yield the escaped character.
pub fn unescape_component(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    let mut escaped = false;
    for c in component.chars() {
        if escaped {
            out.push(if c == 'C' { ':' } else { c });
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else {
            out.push(c);
        }
    }
    out
}

/// Split a permission into unescaped components.
pub fn split(permission: &str) -> Vec<String> {
    permission.split(':').map(unescape_component).collect()
}

/// Join components into a permission, escaping each.
pub fn join<S: AsRef<str>>(components: &[S]) -> String {
    components
        .iter()
        .map(|c| escape_component(c.as_ref()))
        .collect::<Vec<_>>()
        .join(":")
}

/// Every prefix of `permission`, most specific first.
///
/// `fs:abc:read` → `["fs:abc:read", "fs:abc", "fs"]`. Works on the raw
/// string, so escaped colons never split a component.
pub fn parent_permissions(permission: &str) -> Vec<String> {
    let parts: Vec<&str> = permission.split(':').collect();
    (1..=parts.len())
        .rev()
        .map(|n| parts[..n].join(":"))
        .collect()
}
