pub const SCHEMA: &str = r#"
-- Users hold grants; authentication credentials live outside this core
CREATE TABLE IF NOT EXISTS users (
    user_id INTEGER PRIMARY KEY,           -- random 48-bit, non-enumerable
    username TEXT NOT NULL UNIQUE,
    is_admin INTEGER NOT NULL DEFAULT 0,   -- global administrator flag
    ctime TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS groups (
    group_id INTEGER PRIMARY KEY AUTOINCREMENT,
    group_name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS groups_membership (
    fk_group_id INTEGER NOT NULL REFERENCES groups(group_id) ON DELETE CASCADE,
    fk_user_id INTEGER NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    PRIMARY KEY (fk_group_id, fk_user_id)
);

CREATE TABLE IF NOT EXISTS scenes (
    scene_id INTEGER PRIMARY KEY,          -- random 48-bit, non-enumerable
    scene_name TEXT NOT NULL UNIQUE,
    fk_author_id INTEGER REFERENCES users(user_id) ON DELETE SET NULL,

    -- Baseline levels for requests without an explicit grant
    public_access INTEGER NOT NULL DEFAULT 0
        CHECK (public_access BETWEEN 0 AND 1),   -- anonymous: at most read
    default_access INTEGER NOT NULL DEFAULT 1
        CHECK (default_access BETWEEN 0 AND 2),  -- authenticated: never admin

    archived TEXT,                         -- NULL = live; reversible soft-delete
    ctime TEXT NOT NULL
);

-- The append-only version log. Rows are immutable apart from the single
-- hash attach right after insert, inside the same transaction.
CREATE TABLE IF NOT EXISTS files (
    file_id INTEGER PRIMARY KEY AUTOINCREMENT,
    fk_scene_id INTEGER NOT NULL REFERENCES scenes(scene_id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    mime TEXT NOT NULL DEFAULT 'application/octet-stream',
    generation INTEGER NOT NULL,           -- dense 1..N per (scene, name)
    hash TEXT,                             -- NULL = tombstone
    data TEXT,                             -- inline payload for documents
    size INTEGER NOT NULL DEFAULT 0,
    fk_author_id INTEGER REFERENCES users(user_id) ON DELETE SET NULL,
    ctime TEXT NOT NULL,

    UNIQUE (fk_scene_id, name, generation)
);

-- Per-user access-control entries
CREATE TABLE IF NOT EXISTS users_acl (
    fk_user_id INTEGER NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    fk_scene_id INTEGER NOT NULL REFERENCES scenes(scene_id) ON DELETE CASCADE,
    access_level INTEGER NOT NULL CHECK (access_level BETWEEN 0 AND 3),
    PRIMARY KEY (fk_user_id, fk_scene_id)
);

-- Per-group access-control entries
CREATE TABLE IF NOT EXISTS groups_acl (
    fk_group_id INTEGER NOT NULL REFERENCES groups(group_id) ON DELETE CASCADE,
    fk_scene_id INTEGER NOT NULL REFERENCES scenes(scene_id) ON DELETE CASCADE,
    access_level INTEGER NOT NULL CHECK (access_level BETWEEN 0 AND 3),
    PRIMARY KEY (fk_group_id, fk_scene_id)
);

-- Freeform labels, many-to-many with scenes
CREATE TABLE IF NOT EXISTS tags (
    tag_name TEXT NOT NULL,
    fk_scene_id INTEGER NOT NULL REFERENCES scenes(scene_id) ON DELETE CASCADE,
    PRIMARY KEY (tag_name, fk_scene_id)
);

-- Winning generation per (scene, name); current state of every name
CREATE VIEW IF NOT EXISTS current_files AS
    SELECT files.*
    FROM files
    JOIN (
        SELECT fk_scene_id, name, MAX(generation) AS generation
        FROM files
        GROUP BY fk_scene_id, name
    ) AS latest USING (fk_scene_id, name, generation);

CREATE INDEX IF NOT EXISTS idx_files_scene_name ON files(fk_scene_id, name);
CREATE INDEX IF NOT EXISTS idx_files_hash ON files(hash);
CREATE INDEX IF NOT EXISTS idx_users_acl_scene ON users_acl(fk_scene_id);
CREATE INDEX IF NOT EXISTS idx_groups_acl_scene ON groups_acl(fk_scene_id);
CREATE INDEX IF NOT EXISTS idx_membership_user ON groups_membership(fk_user_id);
CREATE INDEX IF NOT EXISTS idx_tags_scene ON tags(fk_scene_id);
"#;
