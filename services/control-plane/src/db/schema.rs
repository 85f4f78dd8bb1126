//! Relational schema of the fleet store.
//!
//! Every statement is idempotent so applying the schema to an existing
//! database is a no-op. Column additions to tables that predate a field are
//! handled by [`crate::evolution`], not here.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    email TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    is_admin INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS api_keys (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    identifier TEXT NOT NULL UNIQUE,
    token_hash TEXT NOT NULL,
    memo TEXT,
    allowed_ips TEXT NOT NULL DEFAULT '[]',
    last_used_at TEXT,
    expires_at TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_api_keys_user ON api_keys(user_id);

CREATE TABLE IF NOT EXISTS regions (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    identifier TEXT NOT NULL UNIQUE,
    country_code TEXT,
    fallback_region_id TEXT REFERENCES regions(id) ON DELETE SET NULL,
    server_limit INTEGER CHECK (server_limit IS NULL OR server_limit >= 0),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS nodes (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    fqdn TEXT NOT NULL,
    daemon_port INTEGER NOT NULL,
    connection_key TEXT NOT NULL,
    is_online INTEGER NOT NULL DEFAULT 0,
    last_checked TEXT,
    maintenance INTEGER NOT NULL DEFAULT 0,
    region_id TEXT REFERENCES regions(id) ON DELETE SET NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_nodes_region ON nodes(region_id);

CREATE TABLE IF NOT EXISTS allocations (
    id TEXT PRIMARY KEY,
    node_id TEXT NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
    bind_address TEXT NOT NULL,
    port INTEGER NOT NULL CHECK (port BETWEEN 1024 AND 65535),
    alias TEXT,
    notes TEXT,
    assigned INTEGER NOT NULL DEFAULT 0,
    server_id TEXT UNIQUE,
    reserved_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (node_id, bind_address, port),
    CHECK (server_id IS NULL OR assigned = 1)
);

CREATE INDEX IF NOT EXISTS idx_allocations_free ON allocations(node_id, assigned, port);

CREATE TABLE IF NOT EXISTS units (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    short_name TEXT NOT NULL UNIQUE,
    description TEXT,
    docker_image TEXT,
    docker_images TEXT,
    default_docker_image TEXT,
    startup TEXT NOT NULL,
    config TEXT NOT NULL DEFAULT '{}',
    variables TEXT NOT NULL DEFAULT '[]',
    install_script TEXT,
    features TEXT,
    meta TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    description TEXT,
    is_default INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_projects_owner ON projects(owner_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_projects_one_default
    ON projects(owner_id) WHERE is_default = 1;

CREATE TABLE IF NOT EXISTS servers (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    owner_id TEXT NOT NULL REFERENCES users(id) ON DELETE RESTRICT,
    node_id TEXT NOT NULL REFERENCES nodes(id) ON DELETE RESTRICT,
    unit_id TEXT NOT NULL REFERENCES units(id) ON DELETE RESTRICT,
    allocation_id TEXT NOT NULL UNIQUE REFERENCES allocations(id) ON DELETE RESTRICT,
    project_id TEXT REFERENCES projects(id) ON DELETE SET NULL,
    docker_image TEXT NOT NULL,
    memory_mb INTEGER NOT NULL,
    disk_mb INTEGER NOT NULL,
    cpu_percent INTEGER NOT NULL,
    state TEXT NOT NULL,
    validation_token_hash TEXT,
    last_error TEXT,
    installed_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_servers_node ON servers(node_id);
CREATE INDEX IF NOT EXISTS idx_servers_owner ON servers(owner_id);
CREATE INDEX IF NOT EXISTS idx_servers_unit ON servers(unit_id);

CREATE TABLE IF NOT EXISTS cargo_items (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    size_bytes INTEGER NOT NULL CHECK (size_bytes >= 0),
    sha256 TEXT NOT NULL,
    mime_type TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (owner_id, name)
);
"#;
