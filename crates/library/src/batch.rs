use crate::error::Result;
use crate::orchestrator::Orchestrator;
use crate::plan::Job;
use async_stream::stream;
use futures::stream::FuturesUnordered;
use futures::{Stream, StreamExt};
use kmanga_catalog::{Issue, Status, User};

/// Issues built at the same time. Deliveries of one issue always run one
/// after the other so it's never built twice.
pub const MAX_CONCURRENT_ISSUES: usize = 4;

/// Progress events emitted by [`Orchestrator::batch`].
///
/// Events follow a strict ordering:
/// 1. [`Started`](Self::Started) exactly once.
/// 2. [`DiscoveryComplete`](Self::DiscoveryComplete) exactly once, with the
///    number of jobs.
/// 3. [`Processed`](Self::Processed) once per job.
/// 4. [`Complete`](Self::Complete) exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEvent {
    Started,
    DiscoveryComplete(u64),
    Processed(Outcome),
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub issue: String,
    pub user: String,
    pub status: Status,
}

impl Orchestrator {
    /// Streams [`BatchEvent`]s while processing `jobs`.
    ///
    /// A failed build or delivery is reported as an outcome with
    /// [`Status::Failed`]; an `Err` item means the catalog couldn't record
    /// the outcome of a job and doesn't end the stream.
    pub fn batch(&self, jobs: Vec<Job>) -> impl Stream<Item = Result<BatchEvent>> + '_ {
        stream!({
            yield Ok(BatchEvent::Started);
            // Infallible: a usize (either 32- or 64-bit) will always fit in a u64.
            yield Ok(BatchEvent::DiscoveryComplete(u64::try_from(jobs.len()).unwrap_or(0)));

            let mut pending: Vec<_> =
                by_issue(jobs).into_iter().map(|(issue, users)| self.process_issue(issue, users)).collect();
            let mut processing = FuturesUnordered::new();
            processing.extend(pending.drain(..MAX_CONCURRENT_ISSUES.min(pending.len())));
            while let Some(results) = processing.next().await {
                for result in results {
                    yield result.map(BatchEvent::Processed);
                }
                if !pending.is_empty() {
                    processing.push(pending.remove(0));
                }
            }

            yield Ok(BatchEvent::Complete);
        })
    }

    async fn process_issue(&self, issue: Issue, users: Vec<User>) -> Vec<Result<Outcome>> {
        let mut results = Vec::with_capacity(users.len());
        for user in users {
            let outcome = self.process(&issue, &user).await.map(|status| Outcome {
                issue: issue.url.clone(),
                user: user.name.clone(),
                status,
            });
            results.push(outcome);
        }
        results
    }
}

/// Groups jobs by issue, keeping the order issues first appear in.
fn by_issue(jobs: Vec<Job>) -> Vec<(Issue, Vec<User>)> {
    let mut groups: Vec<(Issue, Vec<User>)> = Vec::new();
    for Job { issue, user } in jobs {
        match groups.iter_mut().find(|(grouped, _)| grouped.id == issue.id) {
            Some((_, users)) => users.push(user),
            None => groups.push((issue, vec![user])),
        }
    }
    groups
}
