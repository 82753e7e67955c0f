//! The direct/indirect connection-establishment race: whichever mode
//! completes a usable handshake first wins; the loser is aborted.

use std::future::Future;

use crate::error::{SlskError, SlskResult};

/// Run `direct` and `indirect` concurrently. The first to resolve
/// successfully wins and the other is aborted. If both fail, the overall
/// attempt fails with [`SlskError::ConnectionTimeout`], matching the
/// connection-establishment protocol's rule that a double failure means a
/// timeout regardless of the individual errors involved.
pub async fn race_until_first_success<T, A, B>(direct: A, indirect: B) -> SlskResult<T>
where
    T: Send + 'static,
    A: Future<Output = SlskResult<T>> + Send + 'static,
    B: Future<Output = SlskResult<T>> + Send + 'static,
{
    let mut direct_handle = tokio::spawn(direct);
    let mut indirect_handle = tokio::spawn(indirect);
    let mut direct_done = false;
    let mut indirect_done = false;

    loop {
        tokio::select! {
            result = &mut direct_handle, if !direct_done => {
                direct_done = true;
                if let Ok(Ok(value)) = result {
                    indirect_handle.abort();
                    return Ok(value);
                }
            }
            result = &mut indirect_handle, if !indirect_done => {
                indirect_done = true;
                if let Ok(Ok(value)) = result {
                    direct_handle.abort();
                    return Ok(value);
                }
            }
        }
        if direct_done && indirect_done {
            return Err(SlskError::ConnectionTimeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn first_success_wins_even_if_slower_attempt_would_also_succeed() {
        let fast = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<_, SlskError>("direct")
        };
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, SlskError>("indirect")
        };
        let winner = race_until_first_success(fast, slow).await.unwrap();
        assert_eq!(winner, "direct");
    }

    #[tokio::test]
    async fn waits_for_the_other_attempt_after_a_failure() {
        let fails_fast = async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Err::<&str, _>(SlskError::ConnectionTimeout)
        };
        let succeeds_slow = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok("indirect")
        };
        let winner = race_until_first_success(fails_fast, succeeds_slow).await.unwrap();
        assert_eq!(winner, "indirect");
    }

    #[tokio::test]
    async fn both_failing_yields_connection_timeout() {
        let a = async { Err::<&str, _>(SlskError::ConnectionTimeout) };
        let b = async { Err::<&str, _>(SlskError::Protocol("bad".into())) };
        let result = race_until_first_success(a, b).await;
        assert!(matches!(result, Err(SlskError::ConnectionTimeout)));
    }
}
