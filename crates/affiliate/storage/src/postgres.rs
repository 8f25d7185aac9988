//! PostgreSQL adapter for affiliate storage.
//!
//! This adapter is the transactional source of truth. Balance and counter
//! changes are written as in-database increments (`x = x + $n`) inside the same
//! transaction that flips the guarding status, with the referral row locked
//! `FOR UPDATE`, so concurrent writers never lose an update.

use crate::model::{
    ClearingCommit, ClearingCommitted, ClickCommitted, ConversionCommit, ConversionCommitted,
    PayoutCommit, PayoutCommitted,
};
use crate::traits::{
    AffiliateStore, LedgerCommitStore, PageRequest, PayoutStore, QueryWindow, ReferralStore,
};
use crate::{StorageError, StorageResult};
use affiliate_types::{
    normalize_code, Affiliate, AffiliateId, AffiliateStats, AffiliateStatus, Balance,
    BalanceApplied, BalanceMovement, Commission, CommissionStatus, CustomLink, Payout, PayoutId,
    PayoutPolicy, Referral, ReferralId, ReferralStatus, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};

const REFERRAL_COLUMNS: &str = "referral_id, affiliate_id, status, tracking, clicked_at, \
     cookie_expires_at, referred_user_id, signed_up_at, purchase, commission, converted_at, \
     updated_at";

const AFFILIATE_COLUMNS: &str = "affiliate_id, code, display_name, status, commission_rates, \
     attribution, payout_policy, pending_minor, available_minor, lifetime_minor, \
     total_referrals, converted_referrals, total_revenue_minor, conversion_rate, \
     last_referral_at, created_at, updated_at";

/// PostgreSQL-backed storage adapter.
#[derive(Clone)]
pub struct PostgresAffiliateStorage {
    pool: PgPool,
}

impl PostgresAffiliateStorage {
    /// Connect to PostgreSQL and initialize required schema.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    /// Connect with explicit pool parameters.
    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(std::time::Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Backend(format!("failed to connect postgres: {e}")))?;
        Self::from_pool(pool).await
    }

    /// Create adapter from an existing pool.
    pub async fn from_pool(pool: PgPool) -> StorageResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> StorageResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS affiliate_affiliates (
                affiliate_id TEXT PRIMARY KEY,
                code TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL,
                status TEXT NOT NULL,
                commission_rates JSONB NOT NULL,
                attribution JSONB NOT NULL,
                payout_policy JSONB NOT NULL,
                pending_minor BIGINT NOT NULL DEFAULT 0 CHECK (pending_minor >= 0),
                available_minor BIGINT NOT NULL DEFAULT 0 CHECK (available_minor >= 0),
                lifetime_minor BIGINT NOT NULL DEFAULT 0 CHECK (lifetime_minor >= 0),
                total_referrals BIGINT NOT NULL DEFAULT 0,
                converted_referrals BIGINT NOT NULL DEFAULT 0,
                total_revenue_minor BIGINT NOT NULL DEFAULT 0,
                conversion_rate INTEGER NOT NULL DEFAULT 0,
                last_referral_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS affiliate_custom_links (
                affiliate_id TEXT NOT NULL REFERENCES affiliate_affiliates (affiliate_id),
                slug TEXT NOT NULL,
                name TEXT NOT NULL,
                clicks BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (affiliate_id, slug)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS affiliate_referrals (
                referral_id TEXT PRIMARY KEY,
                affiliate_id TEXT NOT NULL REFERENCES affiliate_affiliates (affiliate_id),
                status TEXT NOT NULL,
                tracking JSONB NOT NULL,
                clicked_at TIMESTAMPTZ NOT NULL,
                cookie_expires_at TIMESTAMPTZ NOT NULL,
                referred_user_id TEXT,
                signed_up_at TIMESTAMPTZ,
                purchase JSONB,
                payment_reference TEXT UNIQUE,
                commission JSONB,
                commission_status TEXT,
                clears_at TIMESTAMPTZ,
                converted_at TIMESTAMPTZ,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS affiliate_referrals_due_idx
                ON affiliate_referrals (commission_status, clears_at)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS affiliate_referrals_user_idx
                ON affiliate_referrals (referred_user_id, clicked_at DESC)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS affiliate_payouts (
                payout_id TEXT PRIMARY KEY,
                affiliate_id TEXT NOT NULL REFERENCES affiliate_affiliates (affiliate_id),
                payout JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }

    async fn begin(&self) -> StorageResult<Transaction<'_, Postgres>> {
        self.pool.begin().await.map_err(backend)
    }

    async fn load_links(&self, affiliate_id: &str) -> StorageResult<Vec<CustomLink>> {
        let rows = sqlx::query(
            r#"
            SELECT slug, name, clicks, created_at
              FROM affiliate_custom_links
             WHERE affiliate_id = $1
             ORDER BY created_at ASC
            "#,
        )
        .bind(affiliate_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter()
            .map(|row| {
                Ok(CustomLink {
                    slug: row.try_get("slug").map_err(backend)?,
                    name: row.try_get("name").map_err(backend)?,
                    clicks: from_i64(row.try_get("clicks").map_err(backend)?)?,
                    created_at: row.try_get("created_at").map_err(backend)?,
                })
            })
            .collect()
    }

    async fn hydrate_affiliate(&self, row: PgRow) -> StorageResult<Affiliate> {
        let mut affiliate = affiliate_row_to_record(&row)?;
        affiliate.custom_links = self.load_links(affiliate.affiliate_id.as_str()).await?;
        Ok(affiliate)
    }
}

#[async_trait]
impl AffiliateStore for PostgresAffiliateStorage {
    async fn create_affiliate(&self, affiliate: Affiliate) -> StorageResult<()> {
        let mut tx = self.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO affiliate_affiliates
                (affiliate_id, code, display_name, status, commission_rates, attribution,
                 payout_policy, pending_minor, available_minor, lifetime_minor, total_referrals,
                 converted_referrals, total_revenue_minor, conversion_rate, last_referral_at,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(affiliate.affiliate_id.as_str())
        .bind(normalize_code(&affiliate.code))
        .bind(&affiliate.display_name)
        .bind(affiliate_status_to_str(affiliate.status))
        .bind(to_json(&affiliate.commission_rates)?)
        .bind(to_json(&affiliate.attribution)?)
        .bind(to_json(&affiliate.payout)?)
        .bind(to_i64(affiliate.balance.pending_minor)?)
        .bind(to_i64(affiliate.balance.available_minor)?)
        .bind(to_i64(affiliate.balance.lifetime_minor)?)
        .bind(to_i64(affiliate.stats.total_referrals)?)
        .bind(to_i64(affiliate.stats.converted_referrals)?)
        .bind(to_i64(affiliate.stats.total_revenue_minor)?)
        .bind(i32::try_from(affiliate.stats.conversion_rate).unwrap_or(i32::MAX))
        .bind(affiliate.stats.last_referral_at)
        .bind(affiliate.created_at)
        .bind(affiliate.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_conflict)?;

        for link in &affiliate.custom_links {
            insert_link(&mut tx, affiliate.affiliate_id.as_str(), link).await?;
        }
        tx.commit().await.map_err(backend)
    }

    async fn get_affiliate(&self, affiliate_id: &AffiliateId) -> StorageResult<Option<Affiliate>> {
        let row = sqlx::query(&format!(
            "SELECT {AFFILIATE_COLUMNS} FROM affiliate_affiliates WHERE affiliate_id = $1"
        ))
        .bind(affiliate_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some(row) => self.hydrate_affiliate(row).await.map(Some),
            None => Ok(None),
        }
    }

    async fn find_affiliate_by_code(&self, code: &str) -> StorageResult<Option<Affiliate>> {
        let row = sqlx::query(&format!(
            "SELECT {AFFILIATE_COLUMNS} FROM affiliate_affiliates WHERE code = $1"
        ))
        .bind(normalize_code(code))
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some(row) => self.hydrate_affiliate(row).await.map(Some),
            None => Ok(None),
        }
    }

    async fn set_affiliate_status(
        &self,
        affiliate_id: &AffiliateId,
        status: AffiliateStatus,
        updated_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let result = sqlx::query(
            "UPDATE affiliate_affiliates SET status = $1, updated_at = $2 WHERE affiliate_id = $3",
        )
        .bind(affiliate_status_to_str(status))
        .bind(updated_at)
        .bind(affiliate_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(affiliate_not_found(affiliate_id));
        }
        Ok(())
    }

    async fn set_payout_policy(
        &self,
        affiliate_id: &AffiliateId,
        policy: PayoutPolicy,
        updated_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let result = sqlx::query(
            "UPDATE affiliate_affiliates SET payout_policy = $1, updated_at = $2 WHERE affiliate_id = $3",
        )
        .bind(to_json(&policy)?)
        .bind(updated_at)
        .bind(affiliate_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(affiliate_not_found(affiliate_id));
        }
        Ok(())
    }

    async fn add_custom_link(
        &self,
        affiliate_id: &AffiliateId,
        link: CustomLink,
    ) -> StorageResult<()> {
        let mut tx = self.begin().await?;
        let exists = sqlx::query("SELECT 1 FROM affiliate_affiliates WHERE affiliate_id = $1")
            .bind(affiliate_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?;
        if exists.is_none() {
            return Err(affiliate_not_found(affiliate_id));
        }
        insert_link(&mut tx, affiliate_id.as_str(), &link).await?;
        tx.commit().await.map_err(backend)
    }

    async fn list_affiliates(&self, window: QueryWindow) -> StorageResult<Vec<Affiliate>> {
        let limit = if window.limit == 0 {
            None
        } else {
            Some(usize_to_i64(window.limit)?)
        };
        let rows = sqlx::query(&format!(
            "SELECT {AFFILIATE_COLUMNS} FROM affiliate_affiliates \
             ORDER BY created_at ASC, affiliate_id ASC LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind(usize_to_i64(window.offset)?)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let mut affiliates = Vec::with_capacity(rows.len());
        for row in rows {
            affiliates.push(self.hydrate_affiliate(row).await?);
        }
        Ok(affiliates)
    }
}

#[async_trait]
impl ReferralStore for PostgresAffiliateStorage {
    async fn get_referral(&self, referral_id: &ReferralId) -> StorageResult<Option<Referral>> {
        let row = sqlx::query(&format!(
            "SELECT {REFERRAL_COLUMNS} FROM affiliate_referrals WHERE referral_id = $1"
        ))
        .bind(referral_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.as_ref().map(referral_row_to_record).transpose()
    }

    async fn find_open_referral_for_user(
        &self,
        user_id: &UserId,
        affiliate_id: Option<&AffiliateId>,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<Referral>> {
        let row = sqlx::query(&format!(
            "SELECT {REFERRAL_COLUMNS} FROM affiliate_referrals \
              WHERE referred_user_id = $1 \
                AND ($2::TEXT IS NULL OR affiliate_id = $2) \
                AND status IN ('clicked', 'signed_up') \
                AND cookie_expires_at > $3 \
              ORDER BY clicked_at DESC \
              LIMIT 1"
        ))
        .bind(user_id.as_str())
        .bind(affiliate_id.map(AffiliateId::as_str))
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.as_ref().map(referral_row_to_record).transpose()
    }

    async fn find_referral_by_payment_reference(
        &self,
        reference_id: &str,
    ) -> StorageResult<Option<Referral>> {
        let row = sqlx::query(&format!(
            "SELECT {REFERRAL_COLUMNS} FROM affiliate_referrals WHERE payment_reference = $1"
        ))
        .bind(reference_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.as_ref().map(referral_row_to_record).transpose()
    }

    async fn list_due_commissions(
        &self,
        now: DateTime<Utc>,
        page: PageRequest,
    ) -> StorageResult<Vec<Referral>> {
        let limit = if page.limit == 0 {
            None
        } else {
            Some(usize_to_i64(page.limit)?)
        };
        let rows = sqlx::query(&format!(
            "SELECT {REFERRAL_COLUMNS} FROM affiliate_referrals \
              WHERE commission_status = 'pending' \
                AND clears_at <= $1 \
                AND ($2::TEXT IS NULL OR referral_id > $2) \
              ORDER BY referral_id ASC \
              LIMIT $3"
        ))
        .bind(now)
        .bind(page.after.as_ref().map(ReferralId::as_str))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(referral_row_to_record).collect()
    }

    async fn list_referrals_for_affiliate(
        &self,
        affiliate_id: &AffiliateId,
        commission_status: Option<CommissionStatus>,
    ) -> StorageResult<Vec<Referral>> {
        let rows = sqlx::query(&format!(
            "SELECT {REFERRAL_COLUMNS} FROM affiliate_referrals \
              WHERE affiliate_id = $1 \
                AND ($2::TEXT IS NULL OR commission_status = $2) \
              ORDER BY clicked_at ASC"
        ))
        .bind(affiliate_id.as_str())
        .bind(commission_status.map(CommissionStatus::as_str))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(referral_row_to_record).collect()
    }
}

#[async_trait]
impl PayoutStore for PostgresAffiliateStorage {
    async fn get_payout(&self, payout_id: &PayoutId) -> StorageResult<Option<Payout>> {
        let row = sqlx::query("SELECT payout FROM affiliate_payouts WHERE payout_id = $1")
            .bind(payout_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        row.map(|row| from_json(row.try_get("payout").map_err(backend)?))
            .transpose()
    }

    async fn list_payouts_for_affiliate(
        &self,
        affiliate_id: &AffiliateId,
        window: QueryWindow,
    ) -> StorageResult<Vec<Payout>> {
        let limit = if window.limit == 0 {
            None
        } else {
            Some(usize_to_i64(window.limit)?)
        };
        let rows = sqlx::query(
            r#"
            SELECT payout
              FROM affiliate_payouts
             WHERE affiliate_id = $1
             ORDER BY created_at DESC
             LIMIT $2 OFFSET $3
            "#,
        )
        .bind(affiliate_id.as_str())
        .bind(limit)
        .bind(usize_to_i64(window.offset)?)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter()
            .map(|row| from_json(row.try_get("payout").map_err(backend)?))
            .collect()
    }
}

#[async_trait]
impl LedgerCommitStore for PostgresAffiliateStorage {
    async fn commit_click(&self, referral: Referral) -> StorageResult<ClickCommitted> {
        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO affiliate_referrals
                (referral_id, affiliate_id, status, tracking, clicked_at, cookie_expires_at,
                 updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $5)
            "#,
        )
        .bind(referral.referral_id.as_str())
        .bind(referral.affiliate_id.as_str())
        .bind(referral.status.as_str())
        .bind(to_json(&referral.tracking)?)
        .bind(referral.clicked_at)
        .bind(referral.cookie_expires_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_conflict)?;

        let row = sqlx::query(
            r#"
            UPDATE affiliate_affiliates
               SET total_referrals = total_referrals + 1,
                   last_referral_at = $2,
                   conversion_rate = ROUND(converted_referrals * 100.0 / (total_referrals + 1))::INTEGER,
                   updated_at = $2
             WHERE affiliate_id = $1
            RETURNING total_referrals, converted_referrals, total_revenue_minor, conversion_rate,
                      last_referral_at
            "#,
        )
        .bind(referral.affiliate_id.as_str())
        .bind(referral.clicked_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?
        .ok_or_else(|| affiliate_not_found(&referral.affiliate_id))?;
        let stats = stats_from_row(&row)?;

        let link_matched = match referral.tracking.link_slug.as_deref() {
            Some(slug) => {
                sqlx::query(
                    "UPDATE affiliate_custom_links SET clicks = clicks + 1 \
                      WHERE affiliate_id = $1 AND slug = $2",
                )
                .bind(referral.affiliate_id.as_str())
                .bind(slug)
                .execute(&mut *tx)
                .await
                .map_err(backend)?
                .rows_affected()
                    > 0
            }
            None => false,
        };

        tx.commit().await.map_err(backend)?;
        Ok(ClickCommitted {
            stats,
            link_matched,
        })
    }

    async fn commit_signup(
        &self,
        referral_id: &ReferralId,
        user_id: &UserId,
        at: DateTime<Utc>,
    ) -> StorageResult<Referral> {
        let row = sqlx::query(&format!(
            "UPDATE affiliate_referrals \
                SET status = 'signed_up', referred_user_id = $2, signed_up_at = $3, updated_at = $3 \
              WHERE referral_id = $1 AND status = 'clicked' AND cookie_expires_at > $3 \
             RETURNING {REFERRAL_COLUMNS}"
        ))
        .bind(referral_id.as_str())
        .bind(user_id.as_str())
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some(row) => referral_row_to_record(&row),
            None => match self.get_referral(referral_id).await? {
                Some(existing) => Err(StorageError::PreconditionFailed(format!(
                    "referral {} cannot sign up from status {}",
                    referral_id, existing.status
                ))),
                None => Err(referral_not_found(referral_id)),
            },
        }
    }

    async fn commit_conversion(
        &self,
        commit: ConversionCommit,
    ) -> StorageResult<ConversionCommitted> {
        let mut tx = self.begin().await?;
        let referral = lock_referral(&mut tx, &commit.referral_id).await?;

        if referral.status != commit.expected_from
            || !referral.status.can_advance_to(ReferralStatus::Converted)
            || !referral.cookie_valid_at(commit.converted_at)
        {
            return Err(StorageError::PreconditionFailed(format!(
                "referral {} cannot convert from status {} (expected {})",
                commit.referral_id, referral.status, commit.expected_from
            )));
        }

        let update = sqlx::query(&format!(
            "UPDATE affiliate_referrals \
                SET status = 'converted', purchase = $2, payment_reference = $3, \
                    commission = $4, commission_status = $5, clears_at = $6, \
                    converted_at = $7, updated_at = $7 \
              WHERE referral_id = $1 \
             RETURNING {REFERRAL_COLUMNS}"
        ))
        .bind(commit.referral_id.as_str())
        .bind(to_json(&commit.purchase)?)
        .bind(&commit.purchase.reference_id)
        .bind(to_json(&commit.commission)?)
        .bind(commit.commission.status.as_str())
        .bind(commit.commission.clears_at)
        .bind(commit.converted_at)
        .fetch_one(&mut *tx)
        .await;
        let row = match update {
            Ok(row) => row,
            Err(err) if is_unique_violation(&err) => {
                return Err(StorageError::DuplicatePaymentReference(
                    commit.purchase.reference_id.clone(),
                ))
            }
            Err(err) => return Err(backend(err)),
        };
        let converted = referral_row_to_record(&row)?;

        let balance = apply_movement(
            &mut tx,
            &referral.affiliate_id,
            commit.movement,
            commit.converted_at,
        )
        .await?;

        let row = sqlx::query(
            r#"
            UPDATE affiliate_affiliates
               SET converted_referrals = converted_referrals + 1,
                   total_revenue_minor = total_revenue_minor + $2,
                   conversion_rate = CASE
                        WHEN total_referrals = 0 THEN 0
                        ELSE ROUND((converted_referrals + 1) * 100.0 / total_referrals)::INTEGER
                   END
             WHERE affiliate_id = $1
            RETURNING total_referrals, converted_referrals, total_revenue_minor, conversion_rate,
                      last_referral_at
            "#,
        )
        .bind(referral.affiliate_id.as_str())
        .bind(to_i64(commit.purchase.amount_minor)?)
        .fetch_one(&mut *tx)
        .await
        .map_err(backend)?;
        let stats = stats_from_row(&row)?;

        tx.commit().await.map_err(backend)?;
        Ok(ConversionCommitted {
            referral: converted,
            balance,
            stats,
        })
    }

    async fn commit_clearing(&self, commit: ClearingCommit) -> StorageResult<ClearingCommitted> {
        let mut tx = self.begin().await?;
        let mut referral = lock_referral(&mut tx, &commit.referral_id).await?;

        let Some(commission) = referral.commission.as_mut() else {
            return Err(StorageError::PreconditionFailed(format!(
                "referral {} has no commission",
                commit.referral_id
            )));
        };
        if !commission.is_due_at(commit.cleared_at) {
            return Err(StorageError::PreconditionFailed(format!(
                "commission on referral {} is {} and clears at {}",
                commit.referral_id, commission.status, commission.clears_at
            )));
        }
        commission.status = CommissionStatus::Cleared;
        commission.cleared_at = Some(commit.cleared_at);
        let commission_json = to_json(&*commission)?;
        referral.updated_at = commit.cleared_at;

        write_commission(&mut tx, &referral, commission_json, CommissionStatus::Cleared).await?;
        let balance = apply_movement(
            &mut tx,
            &referral.affiliate_id,
            commit.movement,
            commit.cleared_at,
        )
        .await?;

        tx.commit().await.map_err(backend)?;
        Ok(ClearingCommitted { referral, balance })
    }

    async fn commit_payout(&self, commit: PayoutCommit) -> StorageResult<PayoutCommitted> {
        let mut tx = self.begin().await?;
        let payout = commit.payout;

        for referral_id in &payout.referral_ids {
            let mut referral = lock_referral(&mut tx, referral_id).await?;
            let settles = referral.affiliate_id == payout.affiliate_id
                && referral.status.can_advance_to(ReferralStatus::Paid)
                && referral.commission_status() == Some(CommissionStatus::Cleared);
            let Some(commission) = referral.commission.as_mut().filter(|_| settles) else {
                return Err(StorageError::PreconditionFailed(format!(
                    "referral {} is not a cleared commission of affiliate {}",
                    referral_id, payout.affiliate_id
                )));
            };
            commission.status = CommissionStatus::Paid;
            commission.paid_at = Some(payout.created_at);
            commission.payout_id = Some(payout.payout_id.clone());
            let commission_json = to_json(&*commission)?;
            referral.status = ReferralStatus::Paid;
            referral.updated_at = payout.created_at;

            write_commission(&mut tx, &referral, commission_json, CommissionStatus::Paid).await?;
        }

        sqlx::query(
            r#"
            INSERT INTO affiliate_payouts (payout_id, affiliate_id, payout, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(payout.payout_id.as_str())
        .bind(payout.affiliate_id.as_str())
        .bind(to_json(&payout)?)
        .bind(payout.created_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_conflict)?;

        let balance = apply_movement(
            &mut tx,
            &payout.affiliate_id,
            commit.movement,
            payout.created_at,
        )
        .await?;

        tx.commit().await.map_err(backend)?;
        Ok(PayoutCommitted { payout, balance })
    }
}

async fn insert_link(
    tx: &mut Transaction<'_, Postgres>,
    affiliate_id: &str,
    link: &CustomLink,
) -> StorageResult<()> {
    sqlx::query(
        r#"
        INSERT INTO affiliate_custom_links (affiliate_id, slug, name, clicks, created_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(affiliate_id)
    .bind(&link.slug)
    .bind(&link.name)
    .bind(to_i64(link.clicks)?)
    .bind(link.created_at)
    .execute(&mut **tx)
    .await
    .map_err(map_sqlx_conflict)?;
    Ok(())
}

async fn lock_referral(
    tx: &mut Transaction<'_, Postgres>,
    referral_id: &ReferralId,
) -> StorageResult<Referral> {
    let row = sqlx::query(&format!(
        "SELECT {REFERRAL_COLUMNS} FROM affiliate_referrals WHERE referral_id = $1 FOR UPDATE"
    ))
    .bind(referral_id.as_str())
    .fetch_optional(&mut **tx)
    .await
    .map_err(backend)?
    .ok_or_else(|| referral_not_found(referral_id))?;
    referral_row_to_record(&row)
}

async fn write_commission(
    tx: &mut Transaction<'_, Postgres>,
    referral: &Referral,
    commission_json: serde_json::Value,
    status: CommissionStatus,
) -> StorageResult<()> {
    sqlx::query(
        r#"
        UPDATE affiliate_referrals
           SET status = $2, commission = $3, commission_status = $4, updated_at = $5
         WHERE referral_id = $1
        "#,
    )
    .bind(referral.referral_id.as_str())
    .bind(referral.status.as_str())
    .bind(commission_json)
    .bind(status.as_str())
    .bind(referral.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(backend)?;
    Ok(())
}

/// Apply a movement as increments and report how much a decrement was clamped.
async fn apply_movement(
    tx: &mut Transaction<'_, Postgres>,
    affiliate_id: &AffiliateId,
    movement: BalanceMovement,
    at: DateTime<Utc>,
) -> StorageResult<BalanceApplied> {
    let amount = to_i64(movement.amount_minor())?;
    let (pending, available, lifetime) = match movement {
        BalanceMovement::Accrue { .. } => (amount, 0, amount),
        BalanceMovement::Clear { .. } => (-amount, amount, 0),
        BalanceMovement::Disburse { .. } => (0, -amount, 0),
    };

    let row = sqlx::query(
        r#"
        WITH current AS (
            SELECT affiliate_id, pending_minor, available_minor
              FROM affiliate_affiliates
             WHERE affiliate_id = $1
               FOR UPDATE
        )
        UPDATE affiliate_affiliates a
           SET pending_minor = GREATEST(a.pending_minor + $2, 0),
               available_minor = GREATEST(a.available_minor + $3, 0),
               lifetime_minor = a.lifetime_minor + $4,
               updated_at = $5
          FROM current c
         WHERE a.affiliate_id = c.affiliate_id
        RETURNING a.pending_minor, a.available_minor, a.lifetime_minor,
                  GREATEST(-(c.pending_minor + $2), 0)
                    + GREATEST(-(c.available_minor + $3), 0) AS clamped_minor
        "#,
    )
    .bind(affiliate_id.as_str())
    .bind(pending)
    .bind(available)
    .bind(lifetime)
    .bind(at)
    .fetch_optional(&mut **tx)
    .await
    .map_err(backend)?
    .ok_or_else(|| affiliate_not_found(affiliate_id))?;

    Ok(BalanceApplied {
        balance: Balance {
            pending_minor: from_i64(row.try_get("pending_minor").map_err(backend)?)?,
            available_minor: from_i64(row.try_get("available_minor").map_err(backend)?)?,
            lifetime_minor: from_i64(row.try_get("lifetime_minor").map_err(backend)?)?,
        },
        clamped_minor: from_i64(row.try_get("clamped_minor").map_err(backend)?)?,
    })
}

fn affiliate_row_to_record(row: &PgRow) -> StorageResult<Affiliate> {
    let status: String = row.try_get("status").map_err(backend)?;
    Ok(Affiliate {
        affiliate_id: AffiliateId::new(row.try_get::<String, _>("affiliate_id").map_err(backend)?),
        code: row.try_get("code").map_err(backend)?,
        display_name: row.try_get("display_name").map_err(backend)?,
        status: parse_affiliate_status(&status)?,
        commission_rates: from_json(row.try_get("commission_rates").map_err(backend)?)?,
        attribution: from_json(row.try_get("attribution").map_err(backend)?)?,
        payout: from_json(row.try_get("payout_policy").map_err(backend)?)?,
        balance: Balance {
            pending_minor: from_i64(row.try_get("pending_minor").map_err(backend)?)?,
            available_minor: from_i64(row.try_get("available_minor").map_err(backend)?)?,
            lifetime_minor: from_i64(row.try_get("lifetime_minor").map_err(backend)?)?,
        },
        stats: stats_from_row(row)?,
        custom_links: Vec::new(),
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

fn stats_from_row(row: &PgRow) -> StorageResult<AffiliateStats> {
    let conversion_rate: i32 = row.try_get("conversion_rate").map_err(backend)?;
    Ok(AffiliateStats {
        total_referrals: from_i64(row.try_get("total_referrals").map_err(backend)?)?,
        converted_referrals: from_i64(row.try_get("converted_referrals").map_err(backend)?)?,
        total_revenue_minor: from_i64(row.try_get("total_revenue_minor").map_err(backend)?)?,
        conversion_rate: u32::try_from(conversion_rate).unwrap_or(0),
        last_referral_at: row.try_get("last_referral_at").map_err(backend)?,
    })
}

fn referral_row_to_record(row: &PgRow) -> StorageResult<Referral> {
    let status: String = row.try_get("status").map_err(backend)?;
    let purchase: Option<serde_json::Value> = row.try_get("purchase").map_err(backend)?;
    let commission: Option<serde_json::Value> = row.try_get("commission").map_err(backend)?;
    let referred_user_id: Option<String> = row.try_get("referred_user_id").map_err(backend)?;

    Ok(Referral {
        referral_id: ReferralId::new(row.try_get::<String, _>("referral_id").map_err(backend)?),
        affiliate_id: AffiliateId::new(row.try_get::<String, _>("affiliate_id").map_err(backend)?),
        status: parse_referral_status(&status)?,
        tracking: from_json(row.try_get("tracking").map_err(backend)?)?,
        clicked_at: row.try_get("clicked_at").map_err(backend)?,
        cookie_expires_at: row.try_get("cookie_expires_at").map_err(backend)?,
        referred_user_id: referred_user_id.map(UserId::new),
        signed_up_at: row.try_get("signed_up_at").map_err(backend)?,
        purchase: purchase.map(from_json).transpose()?,
        commission: commission.map(from_json::<Commission>).transpose()?,
        converted_at: row.try_get("converted_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

fn affiliate_status_to_str(status: AffiliateStatus) -> &'static str {
    match status {
        AffiliateStatus::Active => "active",
        AffiliateStatus::Suspended => "suspended",
    }
}

fn parse_affiliate_status(raw: &str) -> StorageResult<AffiliateStatus> {
    match raw {
        "active" => Ok(AffiliateStatus::Active),
        "suspended" => Ok(AffiliateStatus::Suspended),
        other => Err(StorageError::Serialization(format!(
            "unknown affiliate status: {other}"
        ))),
    }
}

fn parse_referral_status(raw: &str) -> StorageResult<ReferralStatus> {
    match raw {
        "clicked" => Ok(ReferralStatus::Clicked),
        "signed_up" => Ok(ReferralStatus::SignedUp),
        "converted" => Ok(ReferralStatus::Converted),
        "paid" => Ok(ReferralStatus::Paid),
        other => Err(StorageError::Serialization(format!(
            "unknown referral status: {other}"
        ))),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> StorageResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> StorageResult<T> {
    serde_json::from_value(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn affiliate_not_found(affiliate_id: &AffiliateId) -> StorageError {
    StorageError::NotFound(format!("affiliate {} not found", affiliate_id))
}

fn referral_not_found(referral_id: &ReferralId) -> StorageError {
    StorageError::NotFound(format!("referral {} not found", referral_id))
}

fn backend(err: sqlx::Error) -> StorageError {
    StorageError::Backend(err.to_string())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}

fn map_sqlx_conflict(err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return StorageError::Conflict(db_err.message().to_string());
        }
    }
    StorageError::Backend(err.to_string())
}

fn to_i64(value: u64) -> StorageResult<i64> {
    i64::try_from(value)
        .map_err(|_| StorageError::InvalidInput(format!("amount {value} exceeds BIGINT range")))
}

fn usize_to_i64(value: usize) -> StorageResult<i64> {
    i64::try_from(value)
        .map_err(|_| StorageError::InvalidInput("window value too large".to_string()))
}

fn from_i64(value: i64) -> StorageResult<u64> {
    u64::try_from(value)
        .map_err(|_| StorageError::Serialization(format!("negative counter in storage: {value}")))
}
