//! Line-protocol writer against the InfluxDB v2 HTTP write API.
//!
//! Certificate validation is skipped; these deployments run with
//! self-signed certificates. In dry-run mode records go to stdout instead
//! of the wire.

pub const DEFAULT_BUCKET: &str = "autogen";

pub struct InfluxWriter {
    write_url: String,
    token: String,
    database: String,
    client: Option<reqwest::blocking::Client>,
}

impl InfluxWriter {
    pub fn new(
        host: &str,
        port: u16,
        database: &str,
        username: &str,
        password: &str,
        ssl: bool,
        dry_run: bool,
    ) -> Result<Self, reqwest::Error> {
        let scheme = if ssl { "https" } else { "http" };
        let client = if dry_run {
            None
        } else {
            Some(
                reqwest::blocking::Client::builder()
                    .gzip(true)
                    .danger_accept_invalid_certs(true)
                    .build()?,
            )
        };

        Ok(Self {
            write_url: format!("{}://{}:{}/api/v2/write", scheme, host, port),
            token: format!("{}:{}", username, password),
            database: database.to_string(),
            client,
        })
    }

    fn bucket_target(&self, bucket: &str) -> String {
        format!("{}/{}", self.database, bucket)
    }

    /// Writes one batch of newline-joined line-protocol records. Callers
    /// run on script-execution threads, so the write blocks.
    pub fn write_record(&self, bucket: &str, lines: &str) -> Result<(), reqwest::Error> {
        if lines.is_empty() {
            return Ok(());
        }

        let target = self.bucket_target(bucket);
        let Some(client) = &self.client else {
            println!("measurements -> {}", target);
            print!("{}", lines);
            return Ok(());
        };

        let response = client
            .post(&self.write_url)
            .query(&[
                ("org", ""),
                ("bucket", target.as_str()),
                ("precision", "ns"),
            ])
            .header(reqwest::header::AUTHORIZATION, format!("Token {}", self.token))
            .body(lines.to_string())
            .send()?;

        if !response.status().is_success() {
            log::warn!(
                "InfluxDB write to {} returned {}",
                target,
                response.status()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_url_respects_ssl_flag() {
        let plain = InfluxWriter::new("tsdb", 8086, "rust", "u", "p", false, true).unwrap();
        assert_eq!(plain.write_url, "http://tsdb:8086/api/v2/write");

        let tls = InfluxWriter::new("tsdb", 8086, "rust", "u", "p", true, true).unwrap();
        assert_eq!(tls.write_url, "https://tsdb:8086/api/v2/write");
    }

    #[test]
    fn bucket_joins_database_and_bucket() {
        let writer = InfluxWriter::new("tsdb", 8086, "rust", "u", "p", false, true).unwrap();
        assert_eq!(writer.bucket_target(DEFAULT_BUCKET), "rust/autogen");
        assert_eq!(writer.bucket_target("raw"), "rust/raw");
    }

    #[test]
    fn dry_run_write_never_touches_the_network() {
        let writer = InfluxWriter::new("tsdb", 8086, "rust", "u", "p", false, true).unwrap();
        writer
            .write_record(DEFAULT_BUCKET, "players,server=s1 value=3\n")
            .unwrap();
        writer.write_record(DEFAULT_BUCKET, "").unwrap();
    }
}
