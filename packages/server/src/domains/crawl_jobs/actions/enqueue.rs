use anyhow::{bail, Result};
use tracing::info;

use crate::domains::crawl_jobs::models::{CrawlJob, NewCrawlJob};
use crate::kernel::ServerDeps;

/// Create a PENDING job and make it visible to the next pull.
pub async fn enqueue_job(input: NewCrawlJob, deps: &ServerDeps) -> Result<CrawlJob> {
    if input.target_ref.trim().is_empty() {
        bail!("target_ref must not be empty");
    }
    if input.lock_ttl_seconds.is_some_and(|ttl| ttl <= 0) {
        bail!("lock_ttl_seconds must be positive");
    }

    let job = input.into_job(deps.job_config.default_lock_ttl_seconds, deps.clock.now());
    deps.job_store.insert_job(&job).await?;
    deps.cache
        .clear_pattern(&deps.cache.keys().pending_jobs_prefix())
        .await;

    info!(
        job_id = %job.id,
        target = %job.target_ref,
        group = %job.target_group,
        priority = job.priority,
        "crawl job enqueued"
    );
    Ok(job)
}

/// Enqueue several jobs, stopping at the first failure.
pub async fn enqueue_jobs(inputs: Vec<NewCrawlJob>, deps: &ServerDeps) -> Result<Vec<CrawlJob>> {
    let mut jobs = Vec::with_capacity(inputs.len());
    for input in inputs {
        jobs.push(enqueue_job(input, deps).await?);
    }
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::domains::crawl_jobs::models::JobStatus;
    use crate::domains::crawl_jobs::store::JobStore;
    use crate::kernel::TestDependencies;

    #[tokio::test]
    async fn enqueued_job_is_pending_and_clears_listings() {
        let test = TestDependencies::new();
        let deps = test.server_deps();
        let listing = deps.cache.keys().pending_jobs(None);
        deps.cache
            .set_json(&listing, &Vec::<String>::new(), Duration::from_secs(60))
            .await;

        let job = enqueue_job(
            NewCrawlJob::builder()
                .target_ref("https://shop.test/item")
                .build(),
            &deps,
        )
        .await
        .unwrap();

        let stored = test.job_store.find_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.target_group, "shop.test");
        assert_eq!(
            stored.lock_ttl_seconds,
            deps.job_config.default_lock_ttl_seconds
        );
        assert_eq!(deps.cache.get_json::<Vec<String>>(&listing).await, None);
    }

    #[tokio::test]
    async fn rejects_blank_target_and_bad_ttl() {
        let deps = TestDependencies::new().server_deps();

        let blank = NewCrawlJob::builder().target_ref("  ").build();
        assert!(enqueue_job(blank, &deps).await.is_err());

        let bad_ttl = NewCrawlJob::builder()
            .target_ref("https://shop.test/item")
            .lock_ttl_seconds(0)
            .build();
        assert!(enqueue_job(bad_ttl, &deps).await.is_err());
    }

    #[tokio::test]
    async fn batch_stops_at_first_invalid_job() {
        let test = TestDependencies::new();
        let deps = test.server_deps();

        let inputs = vec![
            NewCrawlJob::builder().target_ref("https://a.test/1").build(),
            NewCrawlJob::builder().target_ref("").build(),
            NewCrawlJob::builder().target_ref("https://a.test/2").build(),
        ];
        assert!(enqueue_jobs(inputs, &deps).await.is_err());

        let ok = enqueue_jobs(
            vec![
                NewCrawlJob::builder().target_ref("https://a.test/3").build(),
                NewCrawlJob::builder().target_ref("https://a.test/4").build(),
            ],
            &deps,
        )
        .await
        .unwrap();
        assert_eq!(ok.len(), 2);
    }
}
