// src/runtime/script.rs
//! Script text handling: preamble composition and main-section stripping

/// Installs the ambient hooks before caller code runs
pub const PREAMBLE: &str =
    "from sandbox_hooks import install_hooks\ninstall_hooks(_SP_ADD_IMAGE, _SP_CALL_ASYNC_FUNCTION)";

/// Filename reported in tracebacks for caller code
pub const SCRIPT_FILENAME: &str = "_script.py";

const MAIN_GUARD: &str = "if __name__ == '__main__':";

/// Preamble followed by the caller's code
pub fn compose_script(code: &str) -> String {
    format!("{}\n{}", PREAMBLE, code)
}

/// Drop everything from the first `if __name__ == '__main__':` onwards
///
/// Turns a runnable module into a prelude a caller can append its own
/// invocation to.
pub fn strip_main_section(code: &str) -> &str {
    match code.find(MAIN_GUARD) {
        Some(index) => &code[..index],
        None => code,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_script() {
        let script = compose_script("1 + 1");
        assert!(script.starts_with("from sandbox_hooks import install_hooks\n"));
        assert!(script.ends_with("\n1 + 1"));
    }

    #[test]
    fn test_strip_main_section() {
        let module = "def f():\n    return 1\n\nif __name__ == '__main__':\n    f()\n";
        assert_eq!(strip_main_section(module), "def f():\n    return 1\n\n");
        assert_eq!(strip_main_section("x = 1\n"), "x = 1\n");
        // Double-quoted guards are left alone
        let other = "if __name__ == \"__main__\":\n    pass\n";
        assert_eq!(strip_main_section(other), other);
    }
}
