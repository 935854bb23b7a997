//! Parsing for stack identifiers, which are either a bare name or an
//! ARN-like string of the form
//! `arn:<partition>:<service>:<region>:<account>:stack/<name>/<uuid>`
//!.

/// Derives a readable stack name from `stack_id_or_name`.
///
/// Splits the resource segment (the part after the 5th `:`) on `/` and
/// takes index 1 as the name if there are exactly three parts; otherwise
/// the whole input is returned unchanged (it wasn't ARN-shaped).
pub fn stack_name(stack_id_or_name: &str) -> String {
    match resource_segment(stack_id_or_name) {
        Some(resource) => {
            let parts: Vec<&str> = resource.split('/').collect();
            if parts.len() == 3 {
                parts[1].to_string()
            } else {
                stack_id_or_name.to_string()
            }
        }
        None => stack_id_or_name.to_string(),
    }
}

/// Parses the region out of an ARN-like stack identifier.
///
/// Returns `None` if `stack_id_or_name` isn't ARN-shaped (a bare name has
/// no region).
pub fn stack_region(stack_id_or_name: &str) -> Option<String> {
    let mut fields = stack_id_or_name.splitn(6, ':');
    let scheme = fields.next()?;
    if scheme != "arn" {
        return None;
    }
    let _partition = fields.next()?;
    let _service = fields.next()?;
    let region = fields.next()?;
    let _account = fields.next()?;
    let _resource = fields.next()?;

    if region.is_empty() {
        None
    } else {
        Some(region.to_string())
    }
}

/// Returns the resource segment (everything after the 5th `:`) if
/// `stack_id_or_name` is ARN-shaped, i.e. starts with `arn:`.
fn resource_segment(stack_id_or_name: &str) -> Option<&str> {
    if !stack_id_or_name.starts_with("arn:") {
        return None;
    }
    let mut fields = stack_id_or_name.splitn(6, ':');
    let _scheme = fields.next()?;
    let _partition = fields.next()?;
    let _service = fields.next()?;
    let _region = fields.next()?;
    let _account = fields.next()?;
    fields.next()
}
