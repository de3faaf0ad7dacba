mod follower;

pub(crate) use follower::LogFollower;
