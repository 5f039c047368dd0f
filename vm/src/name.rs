use crate::error::VmError;

/// Validates a VM name for use as a directory component under the data root.
pub fn check_name(name: &str) -> Result<(), VmError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(std::path::MAIN_SEPARATOR)
        || name.contains('/')
        || name.contains('\0');
    if bad {
        return Err(VmError::InvalidName(name.to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        for name in ["vm1", "my-vm", "payload.worker", "A_b-3"] {
            assert!(check_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn rejects_path_like_names() {
        for name in ["", ".", "..", "a/b", "/abs", "nul\0byte"] {
            assert!(
                matches!(check_name(name), Err(VmError::InvalidName(_))),
                "{name:?}"
            );
        }
    }
}
