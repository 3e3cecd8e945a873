/// Route component constants shared across crates
pub const API_ROUTE_COMPONENT: &str = "api";
pub const API_ROUTE_PREFIX: &str = const_str::concat!("/", API_ROUTE_COMPONENT);

pub const AUTH_ROUTE_COMPONENT: &str = "auth";
pub const AUTH_ROUTE_PREFIX: &str =
    const_str::concat!(API_ROUTE_PREFIX, "/", AUTH_ROUTE_COMPONENT);

pub const HEALTHCHECK_ROUTE_COMPONENT: &str = "healthcheck";

/// Role id that bypasses every policy check. Mirrored in the casbin matcher.
pub const SUPERUSER_ROLE_ID: i32 = 1;

/// Resource node view flag marking API data permissions (as opposed to menus).
pub const DATA_VIEW: &str = "data";

/// Cache key/value layout version. Bumping it requires a full cache rewarm.
pub const CACHE_FORMAT_VERSION: &str = "v1";

/// `route:v1:{METHOD}:{path}` -> `{resource_key}|{action}`
pub const ROUTE_KEY_PREFIX: &str = const_str::concat!("route:", CACHE_FORMAT_VERSION, ":");

/// Separator between resource key and action in route cache values.
pub const ROUTE_VALUE_SEPARATOR: char = '|';

/// `session:v1:{user_id}:{session_id}` -> marker
pub const SESSION_KEY_PREFIX: &str = const_str::concat!("session:", CACHE_FORMAT_VERSION, ":");

/// `view:v1:{user_id}` -> JSON menu tree
pub const VIEW_KEY_PREFIX: &str = const_str::concat!("view:", CACHE_FORMAT_VERSION, ":");
