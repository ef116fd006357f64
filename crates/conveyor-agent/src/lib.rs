pub mod bootstrap;
pub mod cli;
pub mod connection;
pub mod coordinator;
pub mod dispatcher;
pub mod idle;
pub mod job;
pub mod ping;
pub mod pool;
pub mod signals;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

/// Await a oneshot if one is present, clearing the slot on completion;
/// pend forever otherwise. Shaped for `select!` arms over optional
/// completions, where a guard on the slot would conflict with the borrow.
pub(crate) async fn recv_once<T>(slot: &mut Option<tokio::sync::oneshot::Receiver<T>>) -> Option<T> {
    let result = match slot.as_mut() {
        Some(rx) => rx.await.ok(),
        None => std::future::pending::<Option<T>>().await,
    };
    *slot = None;
    result
}

/// Render a secret with everything but the tail replaced, for log lines.
pub fn redact(secret: &str) -> String {
    if secret.len() <= 4 {
        return "****".to_string();
    }
    format!("****{}", &secret[secret.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_keeps_only_the_tail() {
        assert_eq!(redact("alpacas"), "****acas");
        assert_eq!(redact("abc"), "****");
        assert_eq!(redact(""), "****");
    }
}
