//! SQL Server session over TDS (tiberius on a tokio TCP stream).

use crate::config::{Auth, ConnectionSettings};
use crate::db::{DbError, DbSession, Row, Value};
use tiberius::{AuthMethod, Client, ColumnData, Config, SqlBrowser, ToSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

pub struct MssqlSession {
    client: Client<Compat<TcpStream>>,
}

impl MssqlSession {
    /// Open and authenticate a connection.
    ///
    /// A named instance without an explicit port is located through the SQL
    /// Browser service. A routing redirect from the server is followed once.
    pub async fn connect(settings: &ConnectionSettings) -> Result<Self, DbError> {
        let addr = settings.display_addr();
        let connect_error = |source: Box<dyn std::error::Error + Send + Sync>| DbError::Connect {
            addr: addr.clone(),
            source,
        };

        let config = build_config(settings).map_err(connect_error)?;
        tracing::info!(server = %addr, application = %settings.application, "connecting");

        let tcp = open_stream(&config, settings.instance.is_some() && settings.port.is_none())
            .await
            .map_err(connect_error)?;

        let client = match Client::connect(config.clone(), tcp.compat_write()).await {
            Ok(client) => client,
            Err(tiberius::error::Error::Routing { host, port }) => {
                tracing::info!(%host, port, "following routing redirect");
                let mut config = config;
                config.host(&host);
                config.port(port);
                let tcp = open_stream(&config, false)
                    .await
                    .map_err(connect_error)?;
                Client::connect(config, tcp.compat_write())
                    .await
                    .map_err(|e| connect_error(e.into()))?
            }
            Err(e) => return Err(connect_error(e.into())),
        };

        tracing::info!(server = %addr, "connected");
        Ok(Self { client })
    }
}

fn build_config(
    settings: &ConnectionSettings,
) -> Result<Config, Box<dyn std::error::Error + Send + Sync>> {
    let mut config = Config::new();
    config.host(&settings.host);
    if let Some(port) = settings.port {
        config.port(port);
    }
    if let Some(instance) = &settings.instance {
        config.instance_name(instance);
    }
    config.application_name(&settings.application);
    config.authentication(auth_method(&settings.auth)?);
    if settings.trust_cert {
        config.trust_cert();
    }
    Ok(config)
}

fn auth_method(auth: &Auth) -> Result<AuthMethod, Box<dyn std::error::Error + Send + Sync>> {
    match auth {
        Auth::SqlServer { username, password } => Ok(AuthMethod::sql_server(username, password)),
        #[cfg(windows)]
        Auth::Integrated => Ok(AuthMethod::Integrated),
        #[cfg(not(windows))]
        Auth::Integrated => {
            Err("integrated authentication is only available on Windows; use -u and -p".into())
        }
    }
}

async fn open_stream(
    config: &Config,
    named_instance: bool,
) -> Result<TcpStream, Box<dyn std::error::Error + Send + Sync>> {
    let tcp = if named_instance {
        TcpStream::connect_named(config).await?
    } else {
        TcpStream::connect(config.get_addr()).await?
    };
    tcp.set_nodelay(true)?;
    Ok(tcp)
}

fn query_error(e: tiberius::error::Error) -> DbError {
    DbError::Query { source: e.into() }
}

/// Reduce a TDS column value to the shapes the decoders understand.
fn value_from_column(data: ColumnData<'static>) -> Value {
    match data {
        ColumnData::U8(Some(v)) => Value::Int(i64::from(v)),
        ColumnData::I16(Some(v)) => Value::Int(i64::from(v)),
        ColumnData::I32(Some(v)) => Value::Int(i64::from(v)),
        ColumnData::I64(Some(v)) => Value::Int(v),
        ColumnData::F32(Some(v)) => Value::Float(f64::from(v)),
        ColumnData::F64(Some(v)) => Value::Float(v),
        ColumnData::Bit(Some(v)) => Value::Bool(v),
        ColumnData::String(Some(s)) => Value::Text(s.into_owned()),
        ColumnData::Numeric(Some(n)) if n.scale() == 0 => i64::try_from(n.value())
            .map(Value::Int)
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn convert_row(row: tiberius::Row) -> Row {
    let names: Vec<String> = row
        .columns()
        .iter()
        .map(|column| column.name().to_string())
        .collect();
    Row::new(
        names
            .into_iter()
            .zip(row.into_iter().map(value_from_column))
            .collect(),
    )
}

impl DbSession for MssqlSession {
    async fn query_rows(&mut self, sql: &str, params: &[&str]) -> Result<Vec<Row>, DbError> {
        let params: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
        let rows = self
            .client
            .query(sql, &params)
            .await
            .map_err(query_error)?
            .into_first_result()
            .await
            .map_err(query_error)?;
        Ok(rows.into_iter().map(convert_row).collect())
    }

    async fn query_scalar(&mut self, sql: &str) -> Result<Option<Value>, DbError> {
        let row = self
            .client
            .simple_query(sql)
            .await
            .map_err(query_error)?
            .into_row()
            .await
            .map_err(query_error)?;
        Ok(row.and_then(|row| row.into_iter().next().map(value_from_column)))
    }

    async fn close(self) -> Result<(), DbError> {
        self.client.close().await.map_err(query_error)?;
        tracing::info!("connection closed");
        Ok(())
    }
}
