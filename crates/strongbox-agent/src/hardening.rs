//! Process hardening for the agent.
//!
//! Cached secret values and the client private key live in this process's
//! heap, so before any of them are loaded the daemon turns off core dumps
//! and pins its pages: neither a crash dump nor swap may spill secret
//! bytes to disk. Page pinning needs `CAP_IPC_LOCK` (or root); development
//! hosts can opt out via configuration and accept swappable memory.
//!
//! Everything here is a no-op off Unix.

/// Apply hardening before any secret material enters the process. Returns
/// human-readable warnings for anything that could not be applied; the
/// caller decides how to surface them (logging is not yet initialized).
#[must_use]
pub fn apply(allow_swap: bool) -> Vec<String> {
    let mut warnings = Vec::new();

    if allow_swap {
        warnings.push(
            "memory locking disabled by configuration; cached secrets may be swapped to disk"
                .to_owned(),
        );
    }

    #[cfg(unix)]
    {
        // A core dump of this process would carry every cached secret and
        // the client key in plaintext, so the dump size limit goes to zero
        // first.
        // SAFETY: a plain `setrlimit` call with a zeroed `rlimit` struct.
        // It adjusts a kernel limit for this process and reads or writes
        // no process memory; failure is reported through the return code.
        #[allow(unsafe_code)]
        let rc = unsafe {
            let zero = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            libc::setrlimit(libc::RLIMIT_CORE, &zero)
        };
        if rc != 0 {
            warnings.push(format!(
                "could not disable core dumps: {}",
                std::io::Error::last_os_error()
            ));
        }

        if !allow_swap {
            // Pin current and future pages so cache entries and key
            // material stay resident instead of landing in swap.
            // SAFETY: `mlockall` takes only the two documented flag
            // constants; the kernel validates the request and reports
            // failure (typically missing CAP_IPC_LOCK) via the return
            // code.
            #[allow(unsafe_code)]
            let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
            if rc != 0 {
                warnings.push(format!(
                    "could not lock memory: {} (needs CAP_IPC_LOCK; set \
                     STRONGBOX_AGENT_DISABLE_MLOCK=true on development hosts)",
                    std::io::Error::last_os_error()
                ));
            }
        }
    }

    warnings
}
