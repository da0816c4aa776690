pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# LOGSHIP CONFIGURATION
# =============================================================================
# Configures where log lines are shipped. Two kinds of outputs exist and can be
# combined freely:
#
#   destinations:   Remote append-only log services. Records are buffered in a
#                   local DuckDB file, batched, and delivered in order.
#   archives:       Rotating local files. Each rotated file is uploaded once
#                   to blob storage and renamed with an `.uploaded` postfix.
#
# At least one destination or archive must be configured.
#
# Values may reference environment variables as $env{NAME}; paths may start
# with `~`.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/logship/config.yml
#   3. /etc/logship/config.yml

# =============================================================================
# DESTINATIONS
# =============================================================================

destinations:
  app:
    # Base URL of the log service API
    endpoint: https://logs.example.com
    # Log group; created on first start unless create_group_if_missing is false
    group: my-app
    # Log stream inside the group (defaults to the host name)
    # stream: worker-1
    # Local queue; must not be shared with another destination
    store_path: ~/.local/share/logship/app.duckdb
    # Force a batch out at least this often (minimum 10)
    send_interval_seconds: 60
    # A batch closes as soon as either limit is reached
    max_batch_size_bytes: 1048576
    max_batch_count: 10000
    # Longer messages are truncated; 26 bytes are reserved per message
    max_message_bytes: 262114
    # Applied to the group and to the local queue.
    # One of: 1 3 5 7 14 30 60 90 120 150 180 365 400 545 731 1096 1827 2192
    #         2557 2922 3288 3653
    retention_days: 180
    create_group_if_missing: true
    create_stream_if_missing: true
    request_timeout_seconds: 30

# =============================================================================
# ARCHIVES (optional)
# =============================================================================

# archives:
#   app_files:
#     # Live file; archives are written next to it as app_<timestamp>.log
#     path: /var/log/app/app.log
#     endpoint: http://minio:9000
#     bucket: log-archive
#     # Text between @ signs is a strftime format of the rotation time (UTC)
#     key_pattern: "logs/@%Y/%m/%d@/app-@%H-%M-%S@.log"
#     max_file_size_bytes: 10485760
#     # Minimum time between rotations
#     rotation_check_interval_seconds: 300
#     # Rotate files older than this; 0 disables age-based rotation
#     max_file_age_seconds: 0
#     request_timeout_seconds: 30
"#
    .to_string()
}
