//! Fan-out/fan-in: run concurrent launches to completion and aggregate
//! partial failures.

use std::future::Future;

use tokio::task::JoinSet;

use crate::error::FerryError;

/// Run every launch to completion. One failure never cancels siblings; when
/// any launch fails the result is an [`FerryError::Aggregate`] carrying every
/// individual error.
///
/// Successes arrive in completion order, not submission order.
pub async fn join_all_collecting<T, F>(launches: Vec<F>) -> Result<Vec<T>, FerryError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, FerryError>> + Send + 'static,
{
    let mut set = JoinSet::new();
    for launch in launches {
        set.spawn(launch);
    }

    let mut oks = Vec::new();
    let mut failures = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(value)) => oks.push(value),
            Ok(Err(err)) => failures.push(err),
            Err(e) => failures.push(FerryError::Other(format!("launch task panicked: {e}"))),
        }
    }

    if failures.is_empty() {
        Ok(oks)
    } else {
        Err(FerryError::Aggregate(failures))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use rstest::rstest;

    use super::*;

    #[tokio::test]
    async fn empty_fanout_resolves_immediately() {
        let launches: Vec<std::future::Ready<Result<u32, FerryError>>> = vec![];
        let oks = join_all_collecting(launches).await.unwrap();
        assert!(oks.is_empty());
    }

    #[tokio::test]
    async fn all_successes_are_collected() {
        let launches = (0..5)
            .map(|i| async move { Ok::<u32, FerryError>(i) })
            .collect();
        let mut oks = join_all_collecting(launches).await.unwrap();
        oks.sort_unstable();
        assert_eq!(oks, vec![0, 1, 2, 3, 4]);
    }

    #[rstest]
    #[case::one_of_five(5, 1)]
    #[case::three_of_five(5, 3)]
    #[case::all_of_five(5, 5)]
    #[tokio::test]
    async fn aggregate_holds_exactly_the_failed_launches(
        #[case] total: usize,
        #[case] failing: usize,
    ) {
        let launches = (0..total)
            .map(|i| async move {
                if i < failing {
                    Err(FerryError::ChildFailed(format!("child {i}")))
                } else {
                    Ok(i)
                }
            })
            .collect();

        let err = join_all_collecting(launches).await.unwrap_err();
        let FerryError::Aggregate(failures) = err else {
            panic!("expected aggregate");
        };
        assert_eq!(failures.len(), failing);
        for failure in &failures {
            assert!(matches!(failure, FerryError::ChildFailed(_)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn one_failure_does_not_cancel_siblings() {
        let completed = Arc::new(AtomicUsize::new(0));

        let launches = (0..4)
            .map(|i| {
                let completed = Arc::clone(&completed);
                async move {
                    if i > 0 {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                    completed.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(FerryError::ChildFailed(format!("child {i}")))
                }
            })
            .collect();

        let err = join_all_collecting(launches).await.unwrap_err();
        let FerryError::Aggregate(failures) = err else {
            panic!("expected aggregate");
        };
        assert_eq!(failures.len(), 4);
        assert_eq!(completed.load(Ordering::SeqCst), 4);
    }
}
