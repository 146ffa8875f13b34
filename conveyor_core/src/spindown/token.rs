use tokio_util::sync::CancellationToken;

/// A token issued for every workload registered with the
/// [`Spindown`](crate::Spindown) registry.
///
/// The owning workload uses this token to [signal](SpindownToken::punch_out)
/// that it has gracefully completed and released its resources. Dropping the
/// token punches out implicitly, so simply letting it go out of scope at the
/// end of the workload is enough.
pub struct SpindownToken {
    token: CancellationToken,
}

impl SpindownToken {
    /// Internal constructor.
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Signals that the workload associated with this token has completed its
    /// spindown procedure, whatever it might be.
    pub fn punch_out(&self) {
        self.token.cancel();
    }
}

impl Drop for SpindownToken {
    fn drop(&mut self) {
        self.punch_out();
    }
}
