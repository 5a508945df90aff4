//! SQLite persistence for repositories and their app metadata.
//!
//! Reads go through [`RepoStore`]; every write happens inside a
//! [`StoreTransaction`], which rolls back when dropped without
//! [`StoreTransaction::commit`].

use std::collections::BTreeMap;

use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::{FromRow, Sqlite, SqliteConnection, Transaction};
use tracing::{debug, instrument};

use super::error::StoreError;
use super::model::{
    IndexFormatVersion, NewRepository, Repository, RepositoryPreferences,
};
use crate::db::Database;
use crate::index::model::{AttributeV2, MetadataV2, MirrorV2, RepoV2};

/// Timestamp stored for repositories that have never been updated, so the
/// next index is always newer.
pub const NEVER_UPDATED: i64 = -1;

const ATTRIBUTE_ANTI_FEATURE: &str = "anti_feature";
const ATTRIBUTE_CATEGORY: &str = "category";
const ATTRIBUTE_RELEASE_CHANNEL: &str = "release_channel";

const SELECT_REPOSITORY: &str = r"
    SELECT r.repo_id, r.address, r.web_base_url, r.timestamp, r.version, r.format_version,
           r.max_age, r.name, r.description, r.icon, r.certificate,
           p.weight, p.enabled, p.last_updated, p.last_etag, p.user_mirrors,
           p.disabled_mirrors, p.username, p.password
    FROM repository r
    JOIN repository_preferences p ON p.repo_id = r.repo_id";

#[derive(Debug, FromRow)]
struct RepositoryRow {
    repo_id: i64,
    address: String,
    web_base_url: Option<String>,
    timestamp: i64,
    version: i64,
    format_version: Option<String>,
    max_age: Option<i32>,
    name: String,
    description: String,
    icon: Option<String>,
    certificate: Option<String>,
    weight: i64,
    enabled: bool,
    last_updated: Option<i64>,
    last_etag: Option<String>,
    user_mirrors: String,
    disabled_mirrors: String,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, FromRow)]
struct AttributeRow {
    kind: String,
    id: String,
    name: String,
    description: String,
    icon: Option<String>,
}

fn to_json<T: Serialize>(column: &'static str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::invalid_column(column, &e))
}

fn from_json<T: DeserializeOwned>(column: &'static str, value: &str) -> Result<T, StoreError> {
    serde_json::from_str(value).map_err(|e| StoreError::invalid_column(column, &e))
}

fn optional_json<T: Serialize>(
    column: &'static str,
    value: Option<&T>,
) -> Result<Option<String>, StoreError> {
    value.map(|value| to_json(column, value)).transpose()
}

async fn load_repository(
    conn: &mut SqliteConnection,
    row: RepositoryRow,
) -> Result<Repository, StoreError> {
    let mirrors = sqlx::query_as::<_, (String, Option<String>)>(
        r"SELECT url, country_code FROM mirror WHERE repo_id = ? ORDER BY rowid",
    )
    .bind(row.repo_id)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .map(|(url, country_code)| MirrorV2 { url, country_code })
    .collect();

    let attributes = sqlx::query_as::<_, AttributeRow>(
        r"SELECT kind, id, name, description, icon FROM repo_attribute WHERE repo_id = ?",
    )
    .bind(row.repo_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut anti_features = BTreeMap::new();
    let mut categories = BTreeMap::new();
    let mut release_channels = BTreeMap::new();
    for attribute in attributes {
        let value = AttributeV2 {
            name: from_json("repo_attribute.name", &attribute.name)?,
            description: from_json("repo_attribute.description", &attribute.description)?,
            icon: attribute
                .icon
                .as_deref()
                .map(|icon| from_json("repo_attribute.icon", icon))
                .transpose()?,
        };
        let target = match attribute.kind.as_str() {
            ATTRIBUTE_ANTI_FEATURE => &mut anti_features,
            ATTRIBUTE_CATEGORY => &mut categories,
            _ => &mut release_channels,
        };
        target.insert(attribute.id, value);
    }

    let format_version = match row.format_version.as_deref() {
        Some(value) => Some(value.parse::<IndexFormatVersion>().map_err(|reason| {
            StoreError::InvalidColumn {
                column: "repository.format_version",
                reason,
            }
        })?),
        None => None,
    };

    Ok(Repository {
        repo_id: row.repo_id,
        address: row.address,
        web_base_url: row.web_base_url,
        timestamp: row.timestamp,
        version: row.version,
        format_version,
        max_age: row.max_age,
        name: from_json("repository.name", &row.name)?,
        description: from_json("repository.description", &row.description)?,
        icon: row
            .icon
            .as_deref()
            .map(|icon| from_json("repository.icon", icon))
            .transpose()?,
        certificate: row.certificate,
        mirrors,
        anti_features,
        categories,
        release_channels,
        preferences: RepositoryPreferences {
            weight: row.weight,
            enabled: row.enabled,
            last_updated: row.last_updated,
            last_etag: row.last_etag,
            user_mirrors: from_json("repository_preferences.user_mirrors", &row.user_mirrors)?,
            disabled_mirrors: from_json(
                "repository_preferences.disabled_mirrors",
                &row.disabled_mirrors,
            )?,
            username: row.username,
            password: row.password,
        },
    })
}

async fn fetch_repository(
    conn: &mut SqliteConnection,
    repo_id: i64,
) -> Result<Option<Repository>, StoreError> {
    let row = sqlx::query_as::<_, RepositoryRow>(&format!("{SELECT_REPOSITORY} WHERE r.repo_id = ?"))
        .bind(repo_id)
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(row) => Ok(Some(load_repository(conn, row).await?)),
        None => Ok(None),
    }
}

async fn next_weight(conn: &mut SqliteConnection) -> Result<i64, StoreError> {
    let (max,): (Option<i64>,) = sqlx::query_as("SELECT MAX(weight) FROM repository_preferences")
        .fetch_one(&mut *conn)
        .await?;
    Ok(max.unwrap_or(0) + 1)
}

async fn insert_repository_row(
    conn: &mut SqliteConnection,
    address: &str,
    repository: Option<&NewRepository>,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<i64, StoreError> {
    let (repo_id,): (i64,) = sqlx::query_as(
        r"INSERT INTO repository (address, timestamp, format_version, name, description, icon, certificate)
          VALUES (?, ?, ?, ?, ?, ?, ?)
          RETURNING repo_id",
    )
    .bind(address)
    .bind(NEVER_UPDATED)
    .bind(repository.and_then(|r| r.format_version).map(|v| v.as_str()))
    .bind(to_json("repository.name", &repository.map(|r| r.name.clone()).unwrap_or_default())?)
    .bind(to_json(
        "repository.description",
        &repository.map(|r| r.description.clone()).unwrap_or_default(),
    )?)
    .bind(optional_json("repository.icon", repository.and_then(|r| r.icon.as_ref()))?)
    .bind(repository.map(|r| r.certificate.as_str()))
    .fetch_one(&mut *conn)
    .await?;

    let weight = next_weight(conn).await?;
    sqlx::query(
        r"INSERT INTO repository_preferences (repo_id, weight, username, password)
          VALUES (?, ?, ?, ?)",
    )
    .bind(repo_id)
    .bind(weight)
    .bind(username)
    .bind(password)
    .execute(&mut *conn)
    .await?;

    debug!(repo_id, weight, address, "inserted repository");
    Ok(repo_id)
}

/// Read access to stored repositories and the entry point for transactions.
#[derive(Debug, Clone)]
pub struct RepoStore {
    db: Database,
}

impl RepoStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Starts a transaction. Dropping it without committing rolls back.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if no connection is available.
    pub async fn begin(&self) -> Result<StoreTransaction, StoreError> {
        Ok(StoreTransaction {
            tx: self.db.pool().begin().await?,
        })
    }

    /// # Errors
    ///
    /// Returns [`StoreError`] if the query or a stored column is invalid.
    #[instrument(skip(self))]
    pub async fn get_repository(&self, repo_id: i64) -> Result<Option<Repository>, StoreError> {
        let mut conn = self.db.pool().acquire().await?;
        fetch_repository(&mut conn, repo_id).await
    }

    /// Finds the repository signed with `certificate` (lowercase hex).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query or a stored column is invalid.
    #[instrument(skip(self, certificate))]
    pub async fn get_repository_by_certificate(
        &self,
        certificate: &str,
    ) -> Result<Option<Repository>, StoreError> {
        let mut conn = self.db.pool().acquire().await?;
        let row = sqlx::query_as::<_, RepositoryRow>(&format!(
            "{SELECT_REPOSITORY} WHERE lower(r.certificate) = lower(?) ORDER BY r.repo_id LIMIT 1"
        ))
        .bind(certificate)
        .fetch_optional(&mut *conn)
        .await?;
        match row {
            Some(row) => Ok(Some(load_repository(&mut conn, row).await?)),
            None => Ok(None),
        }
    }

    /// All repositories, highest weight first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query or a stored column is invalid.
    #[instrument(skip(self))]
    pub async fn get_repositories(&self) -> Result<Vec<Repository>, StoreError> {
        let mut conn = self.db.pool().acquire().await?;
        let rows = sqlx::query_as::<_, RepositoryRow>(&format!(
            "{SELECT_REPOSITORY} ORDER BY p.weight DESC"
        ))
        .fetch_all(&mut *conn)
        .await?;
        let mut repositories = Vec::with_capacity(rows.len());
        for row in rows {
            repositories.push(load_repository(&mut conn, row).await?);
        }
        Ok(repositories)
    }

    /// Inserts a placeholder repository that only knows its address. The
    /// first index update fills in everything else.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    #[instrument(skip(self, username, password))]
    pub async fn insert_empty_repository(
        &self,
        address: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<i64, StoreError> {
        let mut tx = self.begin().await?;
        let repo_id = insert_repository_row(&mut tx.tx, address, None, username, password).await?;
        tx.commit().await?;
        Ok(repo_id)
    }

    /// Number of stored apps of a repository.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn count_apps(&self, repo_id: i64) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM app_metadata WHERE repo_id = ?")
            .bind(repo_id)
            .fetch_one(self.db.pool())
            .await?;
        Ok(count)
    }

    /// Total number of rows across every table, for atomicity checks.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn count_rows(&self) -> Result<RowCounts, StoreError> {
        let (repositories, apps, localized_strings): (i64, i64, i64) = sqlx::query_as(
            r"SELECT (SELECT COUNT(*) FROM repository),
                     (SELECT COUNT(*) FROM app_metadata),
                     (SELECT COUNT(*) FROM localized_string)",
        )
        .fetch_one(self.db.pool())
        .await?;
        Ok(RowCounts {
            repositories,
            apps,
            localized_strings,
        })
    }
}

/// Row counts returned by [`RepoStore::count_rows`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RowCounts {
    pub repositories: i64,
    pub apps: i64,
    pub localized_strings: i64,
}

/// An open write transaction.
#[derive(Debug)]
pub struct StoreTransaction {
    tx: Transaction<'static, Sqlite>,
}

impl StoreTransaction {
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the commit fails.
    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the rollback fails.
    pub async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`StoreError`] if the query or a stored column is invalid.
    pub async fn get_repository(&mut self, repo_id: i64) -> Result<Option<Repository>, StoreError> {
        fetch_repository(&mut self.tx, repo_id).await
    }

    /// Inserts a repository found by the add flow with weight
    /// `max(weight) + 1` and a reset timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the insert fails.
    pub async fn insert_repository(&mut self, repository: &NewRepository) -> Result<i64, StoreError> {
        insert_repository_row(
            &mut self.tx,
            &repository.address,
            Some(repository),
            repository.username.as_deref(),
            repository.password.as_deref(),
        )
        .await
    }

    /// Replaces the user-added mirrors of a repository.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RepositoryNotFound`] if no preferences row exists.
    pub async fn update_user_mirrors(
        &mut self,
        repo_id: i64,
        mirrors: &[String],
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE repository_preferences SET user_mirrors = ? WHERE repo_id = ?")
            .bind(to_json("repository_preferences.user_mirrors", &mirrors)?)
            .bind(repo_id)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RepositoryNotFound(repo_id));
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`StoreError::RepositoryNotFound`] if no preferences row exists.
    pub async fn set_weight(&mut self, repo_id: i64, weight: i64) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE repository_preferences SET weight = ? WHERE repo_id = ?")
            .bind(weight)
            .bind(repo_id)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RepositoryNotFound(repo_id));
        }
        Ok(())
    }

    /// Replaces the repository fields and its mirrors and attributes with the
    /// contents of an index.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RepositoryNotFound`] if the row is missing.
    pub async fn update_repository_index(
        &mut self,
        repo_id: i64,
        repo: &RepoV2,
        version: i64,
        format_version: IndexFormatVersion,
        certificate: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"UPDATE repository
              SET address = ?, web_base_url = ?, timestamp = ?, version = ?, format_version = ?,
                  name = ?, description = ?, icon = ?, certificate = ?
              WHERE repo_id = ?",
        )
        .bind(&repo.address)
        .bind(repo.web_base_url.as_deref())
        .bind(repo.timestamp)
        .bind(version)
        .bind(format_version.as_str())
        .bind(to_json("repository.name", &repo.name)?)
        .bind(to_json("repository.description", &repo.description)?)
        .bind(optional_json("repository.icon", repo.icon.as_ref())?)
        .bind(certificate)
        .bind(repo_id)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RepositoryNotFound(repo_id));
        }

        sqlx::query("DELETE FROM mirror WHERE repo_id = ?")
            .bind(repo_id)
            .execute(&mut *self.tx)
            .await?;
        for mirror in &repo.mirrors {
            sqlx::query("INSERT OR IGNORE INTO mirror (repo_id, url, country_code) VALUES (?, ?, ?)")
                .bind(repo_id)
                .bind(&mirror.url)
                .bind(mirror.country_code.as_deref())
                .execute(&mut *self.tx)
                .await?;
        }

        sqlx::query("DELETE FROM repo_attribute WHERE repo_id = ?")
            .bind(repo_id)
            .execute(&mut *self.tx)
            .await?;
        for (kind, attributes) in [
            (ATTRIBUTE_ANTI_FEATURE, &repo.anti_features),
            (ATTRIBUTE_CATEGORY, &repo.categories),
            (ATTRIBUTE_RELEASE_CHANNEL, &repo.release_channels),
        ] {
            for (id, attribute) in attributes {
                sqlx::query(
                    r"INSERT INTO repo_attribute (repo_id, kind, id, name, description, icon)
                      VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(repo_id)
                .bind(kind)
                .bind(id)
                .bind(to_json("repo_attribute.name", &attribute.name)?)
                .bind(to_json("repo_attribute.description", &attribute.description)?)
                .bind(optional_json("repo_attribute.icon", attribute.icon.as_ref())?)
                .execute(&mut *self.tx)
                .await?;
            }
        }
        Ok(())
    }

    /// Removes every app of a repository together with its localized strings.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a delete fails.
    pub async fn clear_apps(&mut self, repo_id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM localized_string WHERE repo_id = ?")
            .bind(repo_id)
            .execute(&mut *self.tx)
            .await?;
        sqlx::query("DELETE FROM app_metadata WHERE repo_id = ?")
            .bind(repo_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    /// Inserts or replaces one app and its localized name, summary and description.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if an insert fails.
    pub async fn insert_app(
        &mut self,
        repo_id: i64,
        package_name: &str,
        metadata: &MetadataV2,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"INSERT OR REPLACE INTO app_metadata
                (repo_id, package_name, added, last_updated, license, web_site, source_code, categories, icon)
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(repo_id)
        .bind(package_name)
        .bind(metadata.added)
        .bind(metadata.last_updated)
        .bind(metadata.license.as_deref())
        .bind(metadata.web_site.as_deref())
        .bind(metadata.source_code.as_deref())
        .bind(to_json("app_metadata.categories", &metadata.categories)?)
        .bind(optional_json("app_metadata.icon", metadata.icon.as_ref())?)
        .execute(&mut *self.tx)
        .await?;

        for (kind, texts) in [
            ("name", &metadata.name),
            ("summary", &metadata.summary),
            ("description", &metadata.description),
        ] {
            for (locale, value) in texts {
                sqlx::query(
                    r"INSERT OR REPLACE INTO localized_string (repo_id, package_name, kind, locale, value)
                      VALUES (?, ?, ?, ?, ?)",
                )
                .bind(repo_id)
                .bind(package_name)
                .bind(kind)
                .bind(locale)
                .bind(value)
                .execute(&mut *self.tx)
                .await?;
            }
        }
        Ok(())
    }
}
