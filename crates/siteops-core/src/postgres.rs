//! PostgreSQL role and database creation, run as the `postgres` system user

use siteops_exec::{Privilege, quote};
use tracing::{info, instrument};

use crate::deploy::Deployer;
use crate::error::CoreError;

const POSTGRES_USER: &str = "postgres";

/// Escape a value for a single-quoted SQL literal
#[must_use]
pub fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Escape a value for a double-quoted SQL identifier
#[must_use]
pub fn sql_identifier(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

fn psql(sql: &str) -> String {
    format!("psql -t -A -c {}", quote(sql))
}

impl Deployer {
    /// Create the project role and database, each only when missing
    ///
    /// # Errors
    /// Missing `db_*` keys or a failing psql/createdb command
    #[instrument(skip(self), fields(host = %self.shell.host()))]
    pub async fn postgres_create(&self) -> Result<(), CoreError> {
        let db_user = self.env.get("db_user")?;
        let db_name = self.env.get("db_name")?;

        if self.pg_user_exists(db_user).await? {
            info!(role = %db_user, "postgres role exists");
        } else {
            self.create_pg_user(db_user, self.env.get("db_password")?)
                .await?;
        }

        if self.database_exists(db_name).await? {
            info!(database = %db_name, "postgres database exists");
        } else {
            self.create_database(db_name, db_user).await?;
        }
        Ok(())
    }

    async fn pg_user_exists(&self, name: &str) -> Result<bool, CoreError> {
        let sql = format!(
            "SELECT COUNT(*) FROM pg_user WHERE usename = {}",
            sql_literal(name)
        );
        let result = self.shell.sudo_as(POSTGRES_USER, &psql(&sql)).await?;
        Ok(result.success() && result.text() == "1")
    }

    async fn create_pg_user(&self, name: &str, password: &str) -> Result<(), CoreError> {
        info!(role = %name, "creating postgres role");
        let sql = format!(
            "CREATE USER {} WITH NOSUPERUSER NOCREATEDB NOCREATEROLE INHERIT LOGIN PASSWORD {}",
            sql_identifier(name),
            sql_literal(password)
        );
        self.shell
            .exec_check_masked(
                &psql(&sql),
                password,
                Privilege::As(POSTGRES_USER.to_string()),
            )
            .await?;
        Ok(())
    }

    async fn database_exists(&self, name: &str) -> Result<bool, CoreError> {
        let result = self
            .shell
            .sudo_as(POSTGRES_USER, &format!("psql -d {} -c 'SELECT 1'", quote(name)))
            .await?;
        Ok(result.success())
    }

    async fn create_database(&self, name: &str, owner: &str) -> Result<(), CoreError> {
        info!(database = %name, owner = %owner, "creating postgres database");
        self.shell
            .exec_check(
                &format!(
                    "createdb --owner {} --template template0 --encoding=UTF8 \
                     --lc-ctype=en_US.UTF-8 --lc-collate=en_US.UTF-8 {}",
                    quote(owner),
                    quote(name)
                ),
                Privilege::As(POSTGRES_USER.to_string()),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_escaping() {
        assert_eq!(sql_literal("it's"), "'it''s'");
        assert_eq!(sql_identifier("app\"user"), "\"app\"\"user\"");
    }

    #[test]
    fn test_psql_is_shell_quoted() {
        assert_eq!(psql("SELECT 1"), "psql -t -A -c 'SELECT 1'");
    }
}
