mod follower_info;
mod leader;

pub(crate) use leader::LogLeader;
